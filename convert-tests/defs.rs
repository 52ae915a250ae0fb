use std::collections::{BTreeMap, BTreeSet};

/// One YAML test: a synthetic dump, the parameters to convert it with and
/// what the converted repository must look like.
#[derive(serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Test {
    #[serde(rename = "svn-dump-source", default)]
    pub(crate) compression: Compression,
    pub(crate) svn_uuid: Option<String>,
    pub(crate) svn_revs: Vec<SvnRev>,
    pub(crate) conv_params: String,
    pub(crate) user_map: Option<String>,
    /// Fetches the revisions up to each of these first, then the whole
    /// dump.
    #[serde(default)]
    pub(crate) fetch_steps: Vec<u32>,
    #[serde(default)]
    pub(crate) exit_code: i32,
    pub(crate) logs: Option<String>,
    #[serde(default)]
    pub(crate) git_tags: Vec<GitTag>,
    pub(crate) git_refs: Option<BTreeSet<String>>,
    #[serde(default)]
    pub(crate) git_revs: Vec<GitRev>,
    #[serde(default)]
    pub(crate) svn_log: Vec<SvnLog>,
}

#[derive(serde::Deserialize, Default)]
pub(crate) enum Compression {
    #[default]
    #[serde(rename = "uncompressed")]
    None,
    #[serde(rename = "compressed-gzip")]
    Gzip,
    #[serde(rename = "compressed-bzip2")]
    Bzip2,
    #[serde(rename = "compressed-xz")]
    Xz,
    #[serde(rename = "compressed-zstd")]
    Zstd,
    #[serde(rename = "compressed-lz4")]
    Lz4,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SvnRev {
    pub(crate) no: Option<u32>,
    #[serde(default)]
    pub(crate) props: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) nodes: Vec<SvnNode>,
}

/// A dump node record. `props` is a full property list; a `null` value
/// writes a deletion entry.
#[derive(serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct SvnNode {
    pub(crate) path: String,
    pub(crate) kind: NodeKind,
    pub(crate) action: NodeAction,
    pub(crate) copy_from_path: Option<String>,
    pub(crate) copy_from_rev: Option<u32>,
    pub(crate) props: Option<BTreeMap<String, Option<String>>>,
    pub(crate) text: Option<String>,
}

#[derive(serde::Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub(crate) enum NodeKind {
    File,
    Dir,
}

#[derive(serde::Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub(crate) enum NodeAction {
    Change,
    Add,
    Delete,
    Replace,
}

impl NodeKind {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

impl NodeAction {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }
}

/// Expected output of `svnbridge log`.
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SvnLog {
    pub(crate) branch: Option<String>,
    pub(crate) template: String,
    pub(crate) output: String,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GitTag {
    pub(crate) tag: String,
    pub(crate) rev: String,
    pub(crate) tagger: Option<Signature>,
    pub(crate) message: Option<String>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GitRev {
    pub(crate) rev: String,
    pub(crate) author: Option<Signature>,
    pub(crate) committer: Option<Signature>,
    pub(crate) message: Option<String>,
    /// Other rev specs that must resolve to the same commit.
    pub(crate) same: Option<Vec<String>>,
    pub(crate) parents: Option<Vec<String>>,
    pub(crate) tree: Option<BTreeMap<String, TreeEntry>>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Signature {
    pub(crate) name: String,
    pub(crate) email: String,
    pub(crate) time: Option<SignatureTime>,
}

/// `SECONDS +HHMM`, as git prints it in raw commit headers.
#[derive(serde::Deserialize, PartialEq, Eq, Debug)]
#[serde(try_from = "String")]
pub(crate) struct SignatureTime {
    pub(crate) seconds: i64,
    /// Signed offset from UTC in seconds.
    pub(crate) offset: i32,
}

impl TryFrom<String> for SignatureTime {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, String> {
        let bad = || format!("invalid signature time {raw:?}");
        let (seconds, zone) = raw.split_once(' ').ok_or_else(bad)?;
        let seconds = seconds.parse().map_err(|_| bad())?;
        let (sign, hhmm) = match zone.split_at_checked(1) {
            Some(("+", hhmm)) => (1, hhmm),
            Some(("-", hhmm)) => (-1, hhmm),
            _ => return Err(bad()),
        };
        if hhmm.len() != 4 {
            return Err(bad());
        }
        let hours: i32 = hhmm[..2].parse().map_err(|_| bad())?;
        let minutes: i32 = hhmm[2..].parse().map_err(|_| bad())?;
        Ok(Self {
            seconds,
            offset: sign * (hours * 3600 + minutes * 60),
        })
    }
}

impl std::fmt::Display for SignatureTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.offset < 0 { '-' } else { '+' };
        let minutes = self.offset.unsigned_abs() / 60;
        write!(f, "{} {sign}{:02}{:02}", self.seconds, minutes / 60, minutes % 60)
    }
}

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub(crate) enum TreeEntry {
    Normal { data: String },
    Exec { data: String },
    Symlink { target: String },
    Dir,
}
