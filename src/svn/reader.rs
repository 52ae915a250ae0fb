use super::dump::{self, DumpReader, NodeAction, NodeRecord, Record, RevRecord};
use super::props::{PropChange, Properties};

pub(crate) use super::dump::NodeKind;

/// One revision of the source history, with its changes in dump order.
#[derive(Clone, Debug)]
pub(crate) struct SourceRevision {
    pub(crate) number: u32,
    pub(crate) properties: Properties,
    pub(crate) changes: Vec<PathChange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CopyFrom {
    pub(crate) rev: u32,
    pub(crate) path: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Add,
    Modify,
    Delete,
    Copy(CopyFrom),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Text {
    pub(crate) is_delta: bool,
    pub(crate) data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PathChange {
    pub(crate) path: Vec<u8>,
    pub(crate) kind: ChangeKind,
    pub(crate) node_kind: Option<NodeKind>,
    pub(crate) properties: Option<PropChange>,
    pub(crate) text: Option<Text>,
}

impl PathChange {
    pub(crate) fn delete(path: &[u8]) -> Self {
        Self {
            path: path.to_vec(),
            kind: ChangeKind::Delete,
            node_kind: None,
            properties: None,
            text: None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum SourceError {
    Dump(dump::ReadError),
    BadPath { rev: u32, path: Vec<u8> },
    MissingKind { rev: u32, path: Vec<u8> },
    NodeOutsideRevision,
}

impl From<dump::ReadError> for SourceError {
    #[inline]
    fn from(e: dump::ReadError) -> Self {
        Self::Dump(e)
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dump(e) => write!(f, "failed to read dump: {e}"),
            Self::BadPath { rev, path } => {
                write!(f, "r{rev}: invalid node path \"{}\"", path.escape_ascii())
            }
            Self::MissingKind { rev, path } => {
                write!(f, "r{rev}: node \"{}\" has no kind", path.escape_ascii())
            }
            Self::NodeOutsideRevision => write!(f, "node record before any revision"),
        }
    }
}

pub(crate) trait RevisionSource {
    /// Identity of the source repository, `None` when unknown.
    fn uuid(&self) -> Option<uuid::Uuid>;

    fn next_revision(&mut self) -> Result<Option<SourceRevision>, SourceError>;
}

/// Trims surrounding slashes and rejects components that cannot name a
/// node. The repository root is the empty path.
pub(crate) fn normalize_path(path: &[u8]) -> Option<Vec<u8>> {
    let start = path.iter().position(|&c| c != b'/').unwrap_or(path.len());
    let end = path.iter().rposition(|&c| c != b'/').map_or(start, |i| i + 1);
    let path = &path[start..end];
    if path.is_empty() {
        return Some(Vec::new());
    }
    if path
        .split(|&c| c == b'/')
        .any(|c| matches!(c, b"" | b"." | b".." | b".svn"))
    {
        return None;
    }
    Some(path.to_vec())
}

pub(crate) struct DumpRevisionReader<R> {
    reader: DumpReader<R>,
    uuid: Option<uuid::Uuid>,
    pending: Option<RevRecord>,
    since: u32,
}

impl<R: std::io::BufRead> DumpRevisionReader<R> {
    /// Reads the stream up to its first revision. Revisions below `since`
    /// are skipped.
    pub(crate) fn new(source: R, since: u32) -> Result<Self, SourceError> {
        let mut reader = DumpReader::new(source)?;
        let mut uuid = None;
        let pending = loop {
            match reader.next_record()? {
                None => break None,
                Some(Record::Uuid(u)) => uuid = Some(u),
                Some(Record::Rev(rev)) => break Some(rev),
                Some(Record::Node(_)) => return Err(SourceError::NodeOutsideRevision),
            }
        };

        if let Some(rev0) = pending.as_ref().filter(|rev| rev.rev_no == 0) {
            if let Some(raw) = rev0.properties.get(b"svn:sync-from-uuid".as_slice()) {
                match uuid::Uuid::try_parse_ascii(raw) {
                    Ok(sync_uuid) => {
                        tracing::info!("using svn:sync-from-uuid {sync_uuid}");
                        uuid = Some(sync_uuid);
                    }
                    Err(_) => {
                        tracing::warn!(
                            "ignoring invalid svn:sync-from-uuid \"{}\"",
                            raw.escape_ascii(),
                        );
                    }
                }
            }
        }

        Ok(Self {
            reader,
            uuid,
            pending,
            since,
        })
    }

    pub(crate) fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    fn read_revision(&mut self, rev: RevRecord) -> Result<SourceRevision, SourceError> {
        let mut changes = Vec::new();
        loop {
            match self.reader.next_record()? {
                None => {
                    self.pending = None;
                    break;
                }
                Some(Record::Rev(next)) => {
                    self.pending = Some(next);
                    break;
                }
                Some(Record::Uuid(_)) => {
                    // concatenated dumps repeat the header
                }
                Some(Record::Node(node)) => push_node(rev.rev_no, node, &mut changes)?,
            }
        }

        Ok(SourceRevision {
            number: rev.rev_no,
            properties: rev.properties,
            changes,
        })
    }
}

fn push_node(rev: u32, node: NodeRecord, changes: &mut Vec<PathChange>) -> Result<(), SourceError> {
    let path = normalize_path(&node.path).ok_or_else(|| SourceError::BadPath {
        rev,
        path: node.path.clone(),
    })?;

    let copy_from = node
        .copy_from
        .map(|(from_rev, from_path)| {
            normalize_path(&from_path)
                .map(|path| CopyFrom {
                    rev: from_rev,
                    path,
                })
                .ok_or(SourceError::BadPath {
                    rev,
                    path: from_path,
                })
        })
        .transpose()?;

    let kind = match node.action {
        NodeAction::Change => ChangeKind::Modify,
        NodeAction::Delete => {
            changes.push(PathChange::delete(&path));
            return Ok(());
        }
        NodeAction::Add | NodeAction::Replace => {
            if node.action == NodeAction::Replace {
                changes.push(PathChange::delete(&path));
            }
            if node.kind.is_none() {
                return Err(SourceError::MissingKind { rev, path });
            }
            copy_from.map_or(ChangeKind::Add, ChangeKind::Copy)
        }
    };

    changes.push(PathChange {
        path,
        kind,
        node_kind: node.kind,
        properties: node.properties,
        text: node.text.map(|t| Text {
            is_delta: t.is_delta,
            data: t.data,
        }),
    });
    Ok(())
}

impl<R: std::io::BufRead> RevisionSource for DumpRevisionReader<R> {
    fn uuid(&self) -> Option<uuid::Uuid> {
        self.uuid
    }

    fn next_revision(&mut self) -> Result<Option<SourceRevision>, SourceError> {
        while let Some(rev) = self.pending.take() {
            let rev = self.read_revision(rev)?;
            if rev.number >= self.since {
                return Ok(Some(rev));
            }
            tracing::trace!("skipping already converted r{}", rev.number);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeKind, CopyFrom, DumpRevisionReader, NodeKind, RevisionSource, normalize_path};
    use crate::svn::dump::{DumpWriter, NodeAction, NodeOut};
    use crate::svn::props::Properties;

    fn node<'a>(path: &'a [u8], kind: Option<NodeKind>, action: NodeAction) -> NodeOut<'a> {
        NodeOut {
            path,
            kind,
            action,
            copy_from: None,
            properties: None,
            text: None,
        }
    }

    fn rev_props() -> Properties {
        Properties::from([
            (b"svn:author".to_vec(), b"alice".to_vec()),
            (b"svn:date".to_vec(), b"2020-01-02T03:04:05.000000Z".to_vec()),
        ])
    }

    fn sample_dump() -> Vec<u8> {
        let mut rev0 = Properties::new();
        rev0.insert(
            b"svn:sync-from-uuid".to_vec(),
            b"6e7a1b52-34d2-4b4c-9f6b-0a7a1e6b6d11".to_vec(),
        );
        let rev_props = rev_props();

        let mut w = DumpWriter::new(Vec::new());
        w.write_header(Some(&uuid::Uuid::nil())).unwrap();
        w.write_revision(0, &rev0).unwrap();
        w.write_revision(1, &rev_props).unwrap();
        w.write_node(&node(b"/trunk/", Some(NodeKind::Dir), NodeAction::Add))
            .unwrap();
        w.write_revision(2, &rev_props).unwrap();
        w.write_node(&NodeOut {
            copy_from: Some((1, b"trunk")),
            ..node(b"tags/t", Some(NodeKind::Dir), NodeAction::Replace)
        })
        .unwrap();
        w.into_inner()
    }

    #[test]
    fn test_read_revisions() {
        let raw = sample_dump();
        let mut reader = DumpRevisionReader::new(raw.as_slice(), 0).unwrap();
        assert_eq!(
            reader.uuid().unwrap().to_string(),
            "6e7a1b52-34d2-4b4c-9f6b-0a7a1e6b6d11",
        );

        let rev0 = reader.next_revision().unwrap().unwrap();
        assert_eq!(rev0.number, 0);
        assert!(rev0.changes.is_empty());

        let rev1 = reader.next_revision().unwrap().unwrap();
        assert_eq!(rev1.properties, rev_props());
        assert_eq!(rev1.changes.len(), 1);
        assert_eq!(rev1.changes[0].path, b"trunk");
        assert_eq!(rev1.changes[0].kind, ChangeKind::Add);

        let rev2 = reader.next_revision().unwrap().unwrap();
        assert_eq!(rev2.changes.len(), 2);
        assert_eq!(rev2.changes[0].kind, ChangeKind::Delete);
        assert_eq!(
            rev2.changes[1].kind,
            ChangeKind::Copy(CopyFrom {
                rev: 1,
                path: b"trunk".to_vec(),
            }),
        );

        assert!(reader.next_revision().unwrap().is_none());
    }

    #[test]
    fn test_skip_since() {
        let raw = sample_dump();
        let mut reader = DumpRevisionReader::new(raw.as_slice(), 2).unwrap();
        assert_eq!(reader.next_revision().unwrap().unwrap().number, 2);
        assert!(reader.next_revision().unwrap().is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b"/a/b/"), Some(b"a/b".to_vec()));
        assert_eq!(normalize_path(b"/"), Some(Vec::new()));
        assert_eq!(normalize_path(b"a//b"), None);
        assert_eq!(normalize_path(b"a/../b"), None);
        assert_eq!(normalize_path(b"a/.svn"), None);
    }
}
