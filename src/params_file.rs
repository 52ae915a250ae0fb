use std::path::PathBuf;

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConvParams {
    #[serde(default)]
    pub(crate) layout: LayoutParams,
    #[serde(default)]
    pub(crate) filemap: FileMapParams,
    #[serde(rename = "keep-deleted-branches", default = "true_")]
    pub(crate) keep_deleted_branches: bool,
    #[serde(rename = "keep-deleted-tags", default = "true_")]
    pub(crate) keep_deleted_tags: bool,
    #[serde(default = "false_")]
    pub(crate) stupid: bool,
    #[serde(rename = "warn-unmapped", default = "false_")]
    pub(crate) warn_unmapped: bool,
    pub(crate) authors: Option<PathBuf>,
    #[serde(rename = "user-fallback-template")]
    pub(crate) user_fallback_template: Option<String>,
    #[serde(rename = "commit-msg-template")]
    pub(crate) commit_msg_template: Option<String>,
    #[serde(rename = "tag-msg-template")]
    pub(crate) tag_msg_template: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub(crate) enum LayoutMode {
    #[serde(rename = "standard")]
    Standard,
    #[serde(rename = "single")]
    Single,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LayoutParams {
    #[serde(default = "default_mode")]
    pub(crate) mode: LayoutMode,
    #[serde(default = "default_trunk")]
    pub(crate) trunk: String,
    #[serde(default = "default_branches")]
    pub(crate) branches: String,
    #[serde(default = "default_tags")]
    pub(crate) tags: String,
    #[serde(default)]
    pub(crate) subdir: String,
    #[serde(rename = "trunk-name", default = "default_trunk_name")]
    pub(crate) trunk_name: String,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            trunk: default_trunk(),
            branches: default_branches(),
            tags: default_tags(),
            subdir: String::new(),
            trunk_name: default_trunk_name(),
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileMapParams {
    #[serde(default = "Vec::new")]
    pub(crate) include: Vec<String>,
    #[serde(default = "Vec::new")]
    pub(crate) exclude: Vec<String>,
}

#[inline(always)]
fn false_() -> bool {
    false
}

#[inline(always)]
fn true_() -> bool {
    true
}

fn default_mode() -> LayoutMode {
    LayoutMode::Standard
}

fn default_trunk() -> String {
    "trunk".into()
}

fn default_branches() -> String {
    "branches".into()
}

fn default_tags() -> String {
    "tags".into()
}

fn default_trunk_name() -> String {
    "default".into()
}
