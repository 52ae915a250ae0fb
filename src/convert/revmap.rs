use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use gix_hash::ObjectId;

use super::layout::BranchKind;
use crate::FHashMap;
use crate::errors::ConvertError;

/// Root trees of a converted revision.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RootTrees {
    /// Full source tree, with a `.svn` blob holding the properties of each
    /// directory.
    pub(crate) meta: ObjectId,
    /// Source tree as seen by git.
    pub(crate) files: ObjectId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum JournalEvent {
    Open {
        kind: BranchKind,
        created_at: u32,
        name: Vec<u8>,
        root: Vec<u8>,
    },
    Close {
        root: Vec<u8>,
    },
    Map {
        commit: ObjectId,
        root: Vec<u8>,
    },
    Tag {
        object: ObjectId,
        root: Vec<u8>,
    },
}

/// Everything recorded for one source revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Transaction {
    pub(crate) uuid: Option<uuid::Uuid>,
    pub(crate) rev: u32,
    pub(crate) trees: RootTrees,
    pub(crate) events: Vec<JournalEvent>,
}

fn escape(out: &mut Vec<u8>, s: &[u8]) {
    for &c in s {
        if matches!(c, b'%' | b'\t' | b'\n' | b'\r') {
            out.extend(format!("%{c:02X}").as_bytes());
        } else {
            out.push(c);
        }
    }
}

fn fields(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&c| c == b'\t').collect()
}

fn unescape(s: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] == b'%' {
            let hex = std::str::from_utf8(s.get((i + 1)..(i + 3))?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(s[i]);
            i += 1;
        }
    }
    Some(out)
}

impl Transaction {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let uuid = self.uuid.map_or_else(|| "-".to_string(), |u| u.to_string());
        out.extend(format!("begin\t{uuid}\t{}\n", self.rev).as_bytes());
        out.extend(format!("trees\t{}\t{}\n", self.trees.meta, self.trees.files).as_bytes());
        for event in self.events.iter() {
            match event {
                JournalEvent::Open {
                    kind,
                    created_at,
                    name,
                    root,
                } => {
                    out.extend(format!("open\t{}\t{created_at}\t", kind.as_str()).as_bytes());
                    escape(&mut out, name);
                    out.push(b'\t');
                    escape(&mut out, root);
                }
                JournalEvent::Close { root } => {
                    out.extend(b"close\t");
                    escape(&mut out, root);
                }
                JournalEvent::Map { commit, root } => {
                    out.extend(format!("map\t{commit}\t").as_bytes());
                    escape(&mut out, root);
                }
                JournalEvent::Tag { object, root } => {
                    out.extend(format!("tag\t{object}\t").as_bytes());
                    escape(&mut out, root);
                }
            }
            out.push(b'\n');
        }
        out.extend(b"end\n");
        out
    }

    fn decode(lines: &[&[u8]]) -> Option<Self> {
        let parse_u32 = |s: &[u8]| std::str::from_utf8(s).ok()?.parse::<u32>().ok();
        let parse_oid = |s: &[u8]| ObjectId::from_hex(s).ok();

        let (first, rest) = lines.split_first()?;
        let (uuid, rev) = match fields(first)[..] {
            [b"begin", b"-", rev] => (None, parse_u32(rev)?),
            [b"begin", uuid, rev] => (
                Some(uuid::Uuid::try_parse_ascii(uuid).ok()?),
                parse_u32(rev)?,
            ),
            _ => return None,
        };
        let (second, rest) = rest.split_first()?;
        let trees = match fields(second)[..] {
            [b"trees", meta, files] => RootTrees {
                meta: parse_oid(meta)?,
                files: parse_oid(files)?,
            },
            _ => return None,
        };

        let mut events = Vec::with_capacity(rest.len());
        for line in rest.iter() {
            let event = match fields(line)[..] {
                [b"open", kind, created_at, name, root] => JournalEvent::Open {
                    kind: BranchKind::parse(kind)?,
                    created_at: parse_u32(created_at)?,
                    name: unescape(name)?,
                    root: unescape(root)?,
                },
                [b"close", root] => JournalEvent::Close {
                    root: unescape(root)?,
                },
                [b"map", commit, root] => JournalEvent::Map {
                    commit: parse_oid(commit)?,
                    root: unescape(root)?,
                },
                [b"tag", object, root] => JournalEvent::Tag {
                    object: parse_oid(object)?,
                    root: unescape(root)?,
                },
                _ => return None,
            };
            events.push(event);
        }

        Some(Self {
            uuid,
            rev,
            trees,
            events,
        })
    }
}

struct RevEntry {
    trees: RootTrees,
    commits: Vec<(Vec<u8>, ObjectId)>,
}

/// Append-only journal mapping source revisions to commits.
pub(crate) struct RevMapStore {
    path: PathBuf,
    file: std::fs::File,
    uuid: Option<uuid::Uuid>,
    revs: BTreeMap<u32, RevEntry>,
    /// Per branch root: `None` while the root has no commit (just opened
    /// or closed), the latest commit otherwise.
    branch_history: FHashMap<Vec<u8>, Vec<(u32, Option<ObjectId>)>>,
    commits: FHashMap<ObjectId, (u32, Vec<u8>)>,
}

impl RevMapStore {
    /// Loads the journal, returning the recorded transactions in order.
    pub(crate) fn open(path: &Path) -> Result<(Self, Vec<Transaction>), ConvertError> {
        Self::open_with(path, true)
    }

    /// Loads an existing journal for queries. An incomplete tail is
    /// ignored and left in place.
    pub(crate) fn open_read_only(path: &Path) -> Result<Self, ConvertError> {
        Self::open_with(path, false).map(|(store, _)| store)
    }

    fn open_with(path: &Path, writable: bool) -> Result<(Self, Vec<Transaction>), ConvertError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if writable && e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                tracing::error!("failed to read {path:?}: {e}");
                return Err(ConvertError::Aborted);
            }
        };

        let mut options = std::fs::OpenOptions::new();
        if writable {
            options.create(true).append(true);
        } else {
            options.read(true);
        }
        let file = options.open(path).map_err(|e| {
            tracing::error!("failed to open {path:?}: {e}");
            ConvertError::Aborted
        })?;

        let mut store = Self {
            path: path.to_path_buf(),
            file,
            uuid: None,
            revs: BTreeMap::new(),
            branch_history: FHashMap::default(),
            commits: FHashMap::default(),
        };

        let mut transactions = Vec::new();
        let mut pending = Vec::new();
        let mut good_len = 0;
        let mut offset = 0;
        while let Some(line_len) = data[offset..].iter().position(|&c| c == b'\n') {
            let line = &data[offset..(offset + line_len)];
            offset += line_len + 1;
            if line != b"end" {
                pending.push(line);
                continue;
            }

            let Some(txn) = Transaction::decode(&pending) else {
                tracing::error!(
                    "malformed transaction in {path:?} before byte offset {offset}",
                );
                return Err(ConvertError::Aborted);
            };
            store.check(&txn)?;
            store.index(&txn);
            transactions.push(txn);
            pending.clear();
            good_len = offset;
        }

        if good_len != data.len() && writable {
            tracing::warn!(
                "discarding incomplete transaction at the end of {path:?} ({} bytes)",
                data.len() - good_len,
            );
            store.file.set_len(good_len as u64).map_err(|e| {
                tracing::error!("failed to truncate {path:?}: {e}");
                ConvertError::Aborted
            })?;
        }

        Ok((store, transactions))
    }

    fn check(&self, txn: &Transaction) -> Result<(), ConvertError> {
        if let Some((&last, _)) = self.revs.last_key_value() {
            if txn.uuid != self.uuid {
                return Err(ConvertError::SourceIntegrity {
                    rev: txn.rev,
                    reason: format!(
                        "source repository {} is not the one converted into this repository ({})",
                        DisplayUuid(txn.uuid),
                        DisplayUuid(self.uuid),
                    ),
                });
            }
            if txn.rev <= last {
                return Err(ConvertError::SourceIntegrity {
                    rev: txn.rev,
                    reason: format!("revision already recorded (last is r{last})"),
                });
            }
        }

        let mut roots = Vec::new();
        for event in txn.events.iter() {
            if let JournalEvent::Map { commit, root } = event {
                if self.commits.contains_key(commit) || roots.contains(&root) {
                    return Err(ConvertError::DuplicateMapping {
                        rev: txn.rev,
                        commit: *commit,
                    });
                }
                roots.push(root);
            }
        }
        Ok(())
    }

    fn index(&mut self, txn: &Transaction) {
        self.uuid = txn.uuid;
        let mut commits = Vec::new();
        for event in txn.events.iter() {
            match event {
                JournalEvent::Open { root, .. } | JournalEvent::Close { root } => {
                    self.branch_history
                        .entry(root.clone())
                        .or_default()
                        .push((txn.rev, None));
                }
                JournalEvent::Map { commit, root } => {
                    self.branch_history
                        .entry(root.clone())
                        .or_default()
                        .push((txn.rev, Some(*commit)));
                    self.commits.insert(*commit, (txn.rev, root.clone()));
                    commits.push((root.clone(), *commit));
                }
                JournalEvent::Tag { .. } => {}
            }
        }
        self.revs.insert(
            txn.rev,
            RevEntry {
                trees: txn.trees,
                commits,
            },
        );
    }

    /// Durably appends a transaction. Objects it references must already
    /// be synced.
    pub(crate) fn commit(&mut self, txn: &Transaction) -> Result<(), ConvertError> {
        self.check(txn)?;
        let raw = txn.encode();
        self.file
            .write_all(&raw)
            .and_then(|()| self.file.sync_data())
            .map_err(|e| {
                tracing::error!("failed to write {:?}: {e}", self.path);
                ConvertError::Aborted
            })?;
        self.index(txn);
        tracing::debug!(
            "recorded r{} with {} event(s)",
            txn.rev,
            txn.events.len(),
        );
        Ok(())
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    #[inline]
    pub(crate) fn uuid(&self) -> Option<uuid::Uuid> {
        self.uuid
    }

    #[inline]
    fn same_source(&self, uuid: Option<uuid::Uuid>) -> bool {
        !self.revs.is_empty() && self.uuid == uuid
    }

    pub(crate) fn last_converted(&self, uuid: Option<uuid::Uuid>) -> Option<u32> {
        if !self.same_source(uuid) {
            return None;
        }
        self.revs.last_key_value().map(|(&rev, _)| rev)
    }

    /// Last commit created while converting `rev`.
    pub(crate) fn lookup(&self, uuid: Option<uuid::Uuid>, rev: u32) -> Option<ObjectId> {
        if !self.same_source(uuid) {
            return None;
        }
        self.revs
            .get(&rev)
            .and_then(|entry| entry.commits.last())
            .map(|&(_, commit)| commit)
    }

    /// Tip of the branch rooted at `root` as of `rev`.
    pub(crate) fn lookup_branch(
        &self,
        uuid: Option<uuid::Uuid>,
        root: &[u8],
        rev: u32,
    ) -> Option<ObjectId> {
        if !self.same_source(uuid) {
            return None;
        }
        let history = self.branch_history.get(root)?;
        let end = history.partition_point(|&(r, _)| r <= rev);
        history[..end].last().and_then(|&(_, commit)| commit)
    }

    /// Revision and branch root a commit was recorded for.
    pub(crate) fn lookup_commit(&self, commit: ObjectId) -> Option<(u32, &[u8])> {
        self.commits
            .get(&commit)
            .map(|(rev, root)| (*rev, root.as_slice()))
    }

    /// Root trees as of `rev`.
    pub(crate) fn root_trees(&self, uuid: Option<uuid::Uuid>, rev: u32) -> Option<RootTrees> {
        if !self.same_source(uuid) {
            return None;
        }
        self.revs
            .range(..=rev)
            .next_back()
            .map(|(_, entry)| entry.trees)
    }
}

struct DisplayUuid(Option<uuid::Uuid>);

impl std::fmt::Display for DisplayUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(uuid) => write!(f, "{uuid}"),
            None => f.write_str("(no UUID)"),
        }
    }
}
