use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use super::dump::{DumpWriter, NodeAction, NodeKind, NodeOut};
use super::props::Properties;
use super::reader::{self, ChangeKind, DumpRevisionReader, RevisionSource as _, SourceRevision};
use super::source::{self, Compression};

/// A single change replayed into the source repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum EditOp {
    Delete {
        path: Vec<u8>,
    },
    AddDir {
        path: Vec<u8>,
        props: Properties,
    },
    AddFile {
        path: Vec<u8>,
        data: Vec<u8>,
        executable: bool,
        symlink: bool,
    },
    ModifyFile {
        path: Vec<u8>,
        data: Vec<u8>,
        executable: bool,
        symlink: bool,
    },
    SetDirProps {
        path: Vec<u8>,
        props: Properties,
    },
}

impl EditOp {
    pub(crate) fn path(&self) -> &[u8] {
        match self {
            Self::Delete { path }
            | Self::AddDir { path, .. }
            | Self::AddFile { path, .. }
            | Self::ModifyFile { path, .. }
            | Self::SetDirProps { path, .. } => path,
        }
    }

    fn class(&self) -> u8 {
        match self {
            Self::Delete { .. } => 0,
            Self::AddDir { .. } | Self::AddFile { .. } => 1,
            Self::ModifyFile { .. } | Self::SetDirProps { .. } => 2,
        }
    }
}

/// Deletes first, then adds, then modifications; by path within each group.
pub(crate) fn sort_ops(ops: &mut [EditOp]) {
    ops.sort_by(|a, b| {
        a.class()
            .cmp(&b.class())
            .then_with(|| a.path().cmp(b.path()))
    });
}

fn file_text(data: &[u8], symlink: bool) -> Vec<u8> {
    let mut text = Vec::with_capacity(data.len() + 5);
    if symlink {
        text.extend(b"link ");
    }
    text.extend(data);
    text
}

/// Sets the properties that carry the git file mode, keeping the others.
fn set_mode_props(props: &mut Properties, executable: bool, symlink: bool) {
    props.remove(b"svn:special".as_slice());
    props.remove(b"svn:executable".as_slice());
    if symlink {
        props.insert(b"svn:special".to_vec(), b"*".to_vec());
    } else if executable {
        props.insert(b"svn:executable".to_vec(), b"*".to_vec());
    }
}

/// Properties of every file of the repository across revisions.
#[derive(Default)]
struct FileProps {
    history: BTreeMap<Vec<u8>, Vec<(u32, Option<Properties>)>>,
}

impl FileProps {
    fn at(&self, path: &[u8], rev: u32) -> Option<&Properties> {
        let history = self.history.get(path)?;
        let i = history.partition_point(|&(r, _)| r <= rev);
        history[..i].last()?.1.as_ref()
    }

    fn head(&self, path: &[u8]) -> Option<&Properties> {
        self.at(path, u32::MAX)
    }

    fn set(&mut self, path: &[u8], rev: u32, props: Option<Properties>) {
        let history = self.history.entry(path.to_vec()).or_default();
        match history.last_mut() {
            Some(last) if last.0 == rev => last.1 = props,
            _ => history.push((rev, props)),
        }
    }

    /// Live paths equal to or below `dir`.
    fn live_below(&self, dir: &[u8], rev: u32) -> Vec<Vec<u8>> {
        self.history
            .range(dir.to_vec()..)
            .take_while(|(path, _)| path.starts_with(dir))
            .filter(|(path, _)| path.len() == dir.len() || path[dir.len()] == b'/')
            .filter(|(path, _)| self.at(path, rev).is_some())
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn delete(&mut self, dir: &[u8], rev: u32) {
        for path in self.live_below(dir, u32::MAX) {
            self.set(&path, rev, None);
        }
    }

    fn copy(&mut self, from: &[u8], from_rev: u32, to: &[u8], rev: u32) {
        for path in self.live_below(from, from_rev) {
            let props = self.at(&path, from_rev).cloned();
            let mut dst = to.to_vec();
            dst.extend_from_slice(&path[from.len()..]);
            self.set(&dst, rev, props);
        }
    }

    fn apply(&mut self, revision: &SourceRevision) {
        let rev = revision.number;
        for change in revision.changes.iter() {
            let path = change.path.as_slice();
            match change.kind {
                ChangeKind::Delete => {
                    self.delete(path, rev);
                    continue;
                }
                ChangeKind::Copy(ref from) => {
                    self.delete(path, rev);
                    self.copy(&from.path, from.rev, path, rev);
                }
                ChangeKind::Add if change.node_kind == Some(NodeKind::File) => {
                    self.delete(path, rev);
                    self.set(path, rev, Some(Properties::new()));
                }
                ChangeKind::Add | ChangeKind::Modify => {}
            }
            if let Some(ref prop_change) = change.properties {
                if let Some(mut props) = self.head(path).cloned() {
                    prop_change.apply(&mut props);
                    self.set(path, rev, Some(props));
                }
            }
        }
    }
}

pub(crate) struct CommitInfo {
    pub(crate) author: Vec<u8>,
    pub(crate) timestamp: i64,
    pub(crate) message: Vec<u8>,
}

impl CommitInfo {
    fn rev_props(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(b"svn:author".to_vec(), self.author.clone());
        let date = chrono::DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default();
        props.insert(
            b"svn:date".to_vec(),
            date.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string().into_bytes(),
        );
        props.insert(b"svn:log".to_vec(), self.message.clone());
        props
    }
}

#[derive(Debug)]
pub(crate) enum EditorError {
    OutOfDate { base: u32, head: u32 },
    Rejected(String),
    Io(std::io::Error),
}

impl std::fmt::Display for EditorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfDate { base, head } => {
                write!(f, "out of date: based on r{base}, repository is at r{head}")
            }
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

/// Write access to the source repository.
pub(crate) trait SourceEditor {
    fn uuid(&self) -> Option<uuid::Uuid>;

    fn head_revision(&self) -> u32;

    /// Commits `ops` as a new revision on top of `base_rev` and returns
    /// its number.
    fn commit(&mut self, base_rev: u32, info: &CommitInfo, ops: &[EditOp])
    -> Result<u32, EditorError>;
}

/// Uses an uncompressed dump file as the repository, appending one revision
/// per commit.
pub(crate) struct DumpFileEditor {
    path: PathBuf,
    uuid: Option<uuid::Uuid>,
    head: u32,
    file_props: FileProps,
}

impl DumpFileEditor {
    pub(crate) fn open(path: &Path) -> Result<Self, String> {
        let (file, compression) = source::sniff_file(path).map_err(|e| e.to_string())?;
        if compression != Compression::None {
            return Err(format!("{path:?} is compressed and cannot be appended to"));
        }

        let mut reader = DumpRevisionReader::new(std::io::BufReader::new(file), 0)
            .map_err(|e| format!("failed to read {path:?}: {e}"))?;
        let mut head = 0;
        let mut file_props = FileProps::default();
        while let Some(rev) = reader
            .next_revision()
            .map_err(|e| format!("failed to read {path:?}: {e}"))?
        {
            head = rev.number;
            file_props.apply(&rev);
        }

        Ok(Self {
            path: path.to_path_buf(),
            uuid: reader.uuid(),
            head,
            file_props,
        })
    }

    /// Full property list to write for a file node, `None` to leave the
    /// properties of an existing file untouched.
    fn file_node_props(&self, op: &EditOp) -> Option<Properties> {
        match *op {
            EditOp::AddFile {
                executable,
                symlink,
                ..
            } => {
                let mut props = Properties::new();
                set_mode_props(&mut props, executable, symlink);
                Some(props)
            }
            EditOp::ModifyFile {
                ref path,
                executable,
                symlink,
                ..
            } => {
                let current = self.file_props.head(path).cloned().unwrap_or_default();
                let mut props = current.clone();
                set_mode_props(&mut props, executable, symlink);
                (props != current).then_some(props)
            }
            EditOp::Delete { .. } | EditOp::AddDir { .. } | EditOp::SetDirProps { .. } => None,
        }
    }

    fn write_ops(
        &self,
        writer: &mut DumpWriter<impl std::io::Write>,
        ops: &[EditOp],
        file_props: &[Option<Properties>],
    ) -> std::io::Result<()> {
        for (op, node_props) in ops.iter().zip(file_props) {
            match op {
                EditOp::Delete { path } => writer.write_node(&NodeOut {
                    path,
                    kind: None,
                    action: NodeAction::Delete,
                    copy_from: None,
                    properties: None,
                    text: None,
                })?,
                EditOp::AddDir { path, props } | EditOp::SetDirProps { path, props } => {
                    let action = if matches!(op, EditOp::AddDir { .. }) {
                        NodeAction::Add
                    } else {
                        NodeAction::Change
                    };
                    writer.write_node(&NodeOut {
                        path,
                        kind: Some(NodeKind::Dir),
                        action,
                        copy_from: None,
                        properties: Some(props),
                        text: None,
                    })?;
                }
                EditOp::AddFile {
                    path,
                    data,
                    symlink,
                    ..
                }
                | EditOp::ModifyFile {
                    path,
                    data,
                    symlink,
                    ..
                } => {
                    let action = if matches!(op, EditOp::AddFile { .. }) {
                        NodeAction::Add
                    } else {
                        NodeAction::Change
                    };
                    writer.write_node(&NodeOut {
                        path,
                        kind: Some(NodeKind::File),
                        action,
                        copy_from: None,
                        properties: node_props.as_ref(),
                        text: Some(&file_text(data, *symlink)),
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl SourceEditor for DumpFileEditor {
    fn uuid(&self) -> Option<uuid::Uuid> {
        self.uuid
    }

    fn head_revision(&self) -> u32 {
        self.head
    }

    fn commit(
        &mut self,
        base_rev: u32,
        info: &CommitInfo,
        ops: &[EditOp],
    ) -> Result<u32, EditorError> {
        if base_rev != self.head {
            return Err(EditorError::OutOfDate {
                base: base_rev,
                head: self.head,
            });
        }
        let bad_path = |op: &&EditOp| {
            let path = op.path();
            path.is_empty() || reader::normalize_path(path).as_deref() != Some(path)
        };
        if let Some(op) = ops.iter().find(bad_path) {
            return Err(EditorError::Rejected(format!(
                "invalid path \"{}\"",
                op.path().escape_ascii(),
            )));
        }

        let new_rev = self.head + 1;
        let file_props: Vec<_> = ops.iter().map(|op| self.file_node_props(op)).collect();
        let mut buf = Vec::new();
        let mut writer = DumpWriter::new(&mut buf);
        writer
            .write_revision(new_rev, &info.rev_props())
            .and_then(|()| self.write_ops(&mut writer, ops, &file_props))
            .map_err(EditorError::Io)?;

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(EditorError::Io)?;
        file.write_all(&buf)
            .and_then(|()| file.sync_all())
            .map_err(EditorError::Io)?;

        tracing::debug!("committed r{new_rev} with {} operation(s)", ops.len());
        self.head = new_rev;
        for (op, props) in ops.iter().zip(file_props) {
            match op {
                EditOp::Delete { path } => self.file_props.delete(path, new_rev),
                EditOp::AddFile { path, .. } => {
                    self.file_props.delete(path, new_rev);
                    self.file_props.set(path, new_rev, props);
                }
                EditOp::ModifyFile { path, .. } => {
                    if props.is_some() {
                        self.file_props.set(path, new_rev, props);
                    }
                }
                EditOp::AddDir { .. } | EditOp::SetDirProps { .. } => {}
            }
        }
        Ok(new_rev)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommitInfo, DumpFileEditor, EditOp, SourceEditor as _, sort_ops};
    use crate::svn::dump::{DumpWriter, NodeAction, NodeKind, NodeOut};
    use crate::svn::props::Properties;
    use crate::svn::reader::{DumpRevisionReader, RevisionSource as _};

    #[test]
    fn test_sort_ops() {
        let mut ops = vec![
            EditOp::ModifyFile {
                path: b"trunk/a".to_vec(),
                data: Vec::new(),
                executable: false,
                symlink: false,
            },
            EditOp::AddFile {
                path: b"trunk/d/x".to_vec(),
                data: Vec::new(),
                executable: false,
                symlink: false,
            },
            EditOp::Delete {
                path: b"trunk/gamma".to_vec(),
            },
            EditOp::AddDir {
                path: b"trunk/d".to_vec(),
                props: Default::default(),
            },
            EditOp::Delete {
                path: b"trunk/beta".to_vec(),
            },
        ];
        sort_ops(&mut ops);
        let paths: Vec<_> = ops.iter().map(|op| op.path().to_vec()).collect();
        assert_eq!(
            paths,
            [
                b"trunk/beta".to_vec(),
                b"trunk/gamma".to_vec(),
                b"trunk/d".to_vec(),
                b"trunk/d/x".to_vec(),
                b"trunk/a".to_vec(),
            ],
        );
    }

    fn props(entries: &[(&str, &str)]) -> Properties {
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    fn modify(path: &str, data: &str, executable: bool) -> EditOp {
        EditOp::ModifyFile {
            path: path.as_bytes().to_vec(),
            data: data.as_bytes().to_vec(),
            executable,
            symlink: false,
        }
    }

    #[test]
    fn test_modify_keeps_file_props() {
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("svnbridge-editor-{suffix:016x}.dump"));

        let mut writer = DumpWriter::new(Vec::new());
        writer.write_header(Some(&uuid::Uuid::from_u128(7))).unwrap();
        writer.write_revision(0, &Properties::new()).unwrap();
        writer.write_revision(1, &props(&[("svn:log", "import")])).unwrap();
        let dir_props = Properties::new();
        writer
            .write_node(&NodeOut {
                path: b"trunk",
                kind: Some(NodeKind::Dir),
                action: NodeAction::Add,
                copy_from: None,
                properties: Some(&dir_props),
                text: None,
            })
            .unwrap();
        let file_props = props(&[("svn:eol-style", "native"), ("svn:executable", "*")]);
        writer
            .write_node(&NodeOut {
                path: b"trunk/run",
                kind: Some(NodeKind::File),
                action: NodeAction::Add,
                copy_from: None,
                properties: Some(&file_props),
                text: Some(b"v1\n"),
            })
            .unwrap();
        writer.write_revision(2, &props(&[("svn:log", "copy")])).unwrap();
        writer
            .write_node(&NodeOut {
                path: b"trunk/run2",
                kind: Some(NodeKind::File),
                action: NodeAction::Add,
                copy_from: Some((1, b"trunk/run")),
                properties: None,
                text: None,
            })
            .unwrap();
        std::fs::write(&path, writer.into_inner()).unwrap();

        let info = CommitInfo {
            author: b"bob".to_vec(),
            timestamp: 1_400_000_000,
            message: b"edit".to_vec(),
        };
        let mut editor = DumpFileEditor::open(&path).unwrap();
        let r3 = editor.commit(2, &info, &[modify("trunk/run", "v2\n", true)]).unwrap();
        assert_eq!(r3, 3);
        let r4 = editor.commit(3, &info, &[modify("trunk/run2", "v2\n", false)]).unwrap();
        assert_eq!(r4, 4);

        let file = std::fs::File::open(&path).unwrap();
        let mut reader = DumpRevisionReader::new(std::io::BufReader::new(file), 3).unwrap();
        let r3 = reader.next_revision().unwrap().unwrap();
        assert_eq!(r3.changes[0].path, b"trunk/run");
        assert_eq!(r3.changes[0].properties, None);
        let r4 = reader.next_revision().unwrap().unwrap();
        assert_eq!(r4.changes[0].path, b"trunk/run2");
        let written = r4.changes[0].properties.as_ref().unwrap();
        assert!(!written.is_delta);
        assert_eq!(
            written.properties,
            std::collections::BTreeMap::from([(
                b"svn:eol-style".to_vec(),
                Some(b"native".to_vec()),
            )]),
        );

        std::fs::remove_file(&path).unwrap();
    }
}
