use gix_hash::ObjectId;

use super::revmap::RevMapStore;
use crate::errors::ConvertError;
use crate::git::{ObjectStore, StoreError};

/// Extra commit header naming the source revision of a commit.
pub(crate) const HEADER: &str = "convert-revision";

/// Where a commit came from in the source repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Provenance {
    pub(crate) uuid: Option<uuid::Uuid>,
    pub(crate) path: Vec<u8>,
    pub(crate) rev: u32,
}

impl Provenance {
    /// `svn:<uuid>/<path>@<rev>`, without the `/<path>` part for the
    /// repository root.
    pub(crate) fn format(&self) -> String {
        let uuid = self.uuid.map(|u| u.to_string()).unwrap_or_default();
        if self.path.is_empty() {
            format!("svn:{uuid}@{}", self.rev)
        } else {
            format!(
                "svn:{uuid}/{}@{}",
                String::from_utf8_lossy(&self.path),
                self.rev,
            )
        }
    }

    pub(crate) fn parse(raw: &[u8]) -> Option<Self> {
        let rest = raw.strip_prefix(b"svn:")?;
        let at = rest.iter().rposition(|&c| c == b'@')?;
        let rev = std::str::from_utf8(&rest[(at + 1)..]).ok()?.parse().ok()?;
        let rest = &rest[..at];
        let (uuid, path) = match rest.iter().position(|&c| c == b'/') {
            Some(i) => (&rest[..i], &rest[(i + 1)..]),
            None => (rest, &b""[..]),
        };
        let uuid = if uuid.is_empty() {
            None
        } else {
            Some(uuid::Uuid::try_parse_ascii(uuid).ok()?)
        };
        Some(Self {
            uuid,
            path: path.to_vec(),
            rev,
        })
    }
}

#[derive(serde::Serialize)]
struct LogCtx {
    rev: usize,
    commit: String,
    svnrev: String,
    svnpath: String,
    svnuuid: String,
}

fn store_error(e: StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError::Aborted
}

/// Resolves a branch name to a commit, trying branches before tags.
fn resolve_branch(store: &ObjectStore, branch: Option<&str>) -> Result<ObjectId, ConvertError> {
    let candidates = match branch {
        Some(name) => vec![format!("refs/heads/{name}"), format!("refs/tags/{name}")],
        None => vec!["HEAD".to_string()],
    };
    for ref_name in candidates.iter() {
        if let Some(id) = store.read_ref(ref_name).map_err(store_error)? {
            return store.peel_to_commit(id).map_err(store_error);
        }
    }
    tracing::error!("branch \"{}\" not found", branch.unwrap_or("HEAD"));
    Err(ConvertError::Aborted)
}

/// Renders `template` for every commit of the first-parent history of a
/// branch, oldest first.
pub(crate) fn log(
    store: &ObjectStore,
    revmap: &RevMapStore,
    branch: Option<&str>,
    template: &str,
) -> Result<String, ConvertError> {
    let mut jinja_env = minijinja::Environment::empty();
    jinja_env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
    jinja_env.set_keep_trailing_newline(true);
    jinja_env.add_template("log", template).map_err(|e| {
        tracing::error!("failed to parse log template: {e}");
        ConvertError::Aborted
    })?;
    let tmpl = jinja_env.get_template("log").map_err(|e| {
        tracing::error!("{e}");
        ConvertError::Aborted
    })?;

    let mut chain = Vec::new();
    let mut next = Some(resolve_branch(store, branch)?);
    while let Some(id) = next {
        let commit = store.get_commit(id).map_err(store_error)?;
        next = commit.parents.first().copied();
        chain.push((id, commit));
    }

    let mut out = String::new();
    for (i, (id, commit)) in chain.into_iter().rev().enumerate() {
        let provenance = commit
            .header(HEADER.as_bytes())
            .and_then(Provenance::parse)
            .or_else(|| {
                revmap.lookup_commit(id).map(|(rev, root)| Provenance {
                    uuid: revmap.uuid(),
                    path: root.to_vec(),
                    rev,
                })
            });
        let ctx = match provenance {
            Some(p) => LogCtx {
                rev: i,
                commit: id.to_string(),
                svnrev: p.rev.to_string(),
                svnpath: format!("/{}", String::from_utf8_lossy(&p.path)),
                svnuuid: p.uuid.map(|u| u.to_string()).unwrap_or_default(),
            },
            None => LogCtx {
                rev: i,
                commit: id.to_string(),
                svnrev: String::new(),
                svnpath: String::new(),
                svnuuid: String::new(),
            },
        };
        let rendered = tmpl.render(&ctx).map_err(|e| {
            tracing::error!("failed to render log template: {e}");
            ConvertError::Aborted
        })?;
        out.push_str(&rendered);
    }
    Ok(out)
}
