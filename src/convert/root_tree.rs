use gix_hash::ObjectId;
use gix_object::tree::{EntryKind, EntryMode};

use super::filemap::FileMap;
use super::layout::{Layout, PathClass, join_path};
use super::revmap::{RevMapStore, RootTrees};
use crate::errors::{Anomaly, ConflictKind, ConvertError, Failure, Report};
use crate::git::{ObjectStore, StoreError, TreeBuilder};
use crate::svn::{self, ChangeKind, CopyFrom, NodeKind, PathChange, PropChange, Properties};

/// Name of the blob holding directory properties in the meta tree.
pub(crate) const PROPS_BLOB: &[u8] = b".svn";

/// A change applied to the root trees, as seen by the branch detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RootOp {
    DelPath {
        path: Vec<u8>,
        was_dir: bool,
    },
    ModFile {
        path: Vec<u8>,
        mode: EntryMode,
        oid: ObjectId,
        copied_from: Option<CopyFrom>,
    },
    AddDir {
        path: Vec<u8>,
    },
    CopyDir {
        path: Vec<u8>,
        from: CopyFrom,
    },
    DirProps {
        path: Vec<u8>,
    },
}

impl RootOp {
    pub(crate) fn path(&self) -> &[u8] {
        match self {
            Self::DelPath { path, .. }
            | Self::ModFile { path, .. }
            | Self::AddDir { path }
            | Self::CopyDir { path, .. }
            | Self::DirProps { path } => path,
        }
    }
}

fn store_error(e: StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError::Aborted
}

/// Reads the properties of the directory at `dir` in a meta tree.
pub(crate) fn read_dir_props(
    store: &ObjectStore,
    meta_tree: ObjectId,
    dir: &[u8],
) -> Result<Properties, ConvertError> {
    let Some((_, oid)) = store
        .ls(meta_tree, &join_path(dir, PROPS_BLOB))
        .map_err(store_error)?
    else {
        return Ok(Properties::new());
    };
    let raw = store.get_blob(oid).map_err(store_error)?;
    Ok(svn::prop_list::deserialize(&raw).unwrap_or_else(|| {
        tracing::warn!("ignoring malformed properties of \"{}\"", dir.escape_ascii());
        Properties::new()
    }))
}

struct FileState {
    content: Vec<u8>,
    executable: bool,
    special: bool,
}

impl FileState {
    fn empty() -> Self {
        Self {
            content: Vec::new(),
            executable: false,
            special: false,
        }
    }

    fn load(store: &ObjectStore, mode: EntryMode, oid: ObjectId) -> Result<Self, ConvertError> {
        let blob = store.get_blob(oid).map_err(store_error)?;
        let special = mode.kind() == EntryKind::Link;
        let content = if special {
            let mut content = b"link ".to_vec();
            content.extend(blob);
            content
        } else {
            blob
        };
        Ok(Self {
            content,
            executable: mode.kind() == EntryKind::BlobExecutable,
            special,
        })
    }

    fn apply_props(&mut self, change: &PropChange) {
        let flag = |key: &[u8]| match change.get(key) {
            Some(value) => Some(value.is_some()),
            None if !change.is_delta => Some(false),
            None => None,
        };
        if let Some(executable) = flag(b"svn:executable") {
            self.executable = executable;
        }
        if let Some(special) = flag(b"svn:special") {
            self.special = special;
        }
    }

    fn into_entry(self) -> (EntryMode, Vec<u8>) {
        if self.special {
            if let Some(target) = self.content.strip_prefix(b"link ") {
                return (EntryKind::Link.into(), target.to_vec());
            }
        }
        if self.executable {
            (EntryKind::BlobExecutable.into(), self.content)
        } else {
            (EntryKind::Blob.into(), self.content)
        }
    }
}

/// Applies the changes of one revision to the meta and files trees.
pub(crate) struct RootEditor<'a> {
    layout: &'a Layout,
    filemap: &'a FileMap,
    rev: u32,
    meta: TreeBuilder,
    files: TreeBuilder,
    ops: Vec<RootOp>,
}

impl<'a> RootEditor<'a> {
    pub(crate) fn new(
        layout: &'a Layout,
        filemap: &'a FileMap,
        rev: u32,
        base: Option<RootTrees>,
        store: &mut ObjectStore,
    ) -> Result<Self, ConvertError> {
        let (meta, files) = match base {
            Some(trees) => (
                TreeBuilder::with_base(trees.meta),
                TreeBuilder::with_base(trees.files),
            ),
            None => {
                let mut meta = TreeBuilder::new();
                meta.mod_inline(
                    PROPS_BLOB,
                    EntryKind::Blob.into(),
                    svn::prop_list::serialize(&Properties::new()),
                    store,
                )
                .map_err(store_error)?;
                (meta, TreeBuilder::new())
            }
        };
        Ok(Self {
            layout,
            filemap,
            rev,
            meta,
            files,
            ops: Vec::new(),
        })
    }

    fn in_files_tree(&self, path: &[u8]) -> bool {
        match self.layout.classify(path) {
            PathClass::Branch(loc) => self.filemap.includes(loc.rel),
            PathClass::Container | PathClass::Unmapped => true,
        }
    }

    fn integrity(&self, reason: String) -> ConvertError {
        ConvertError::SourceIntegrity {
            rev: self.rev,
            reason,
        }
    }

    fn conflict(&self, path: &[u8], kind: ConflictKind) -> Anomaly {
        Anomaly::ContentConflict {
            rev: self.rev,
            path: path.to_vec(),
            kind,
        }
    }

    /// Turns a failed tree edit into a conflict when the parent path is a
    /// file.
    fn tree_edit<T>(&self, r: Result<T, StoreError>, path: &[u8]) -> Result<T, Failure> {
        match r {
            Ok(v) => Ok(v),
            Err(StoreError::ParentPathIsNotDir { .. }) => {
                Err(self.conflict(path, ConflictKind::NotADirectory).into())
            }
            Err(e) => Err(store_error(e).into()),
        }
    }

    /// Applies one path change. A conflicting change is skipped and noted
    /// in `report`.
    pub(crate) fn apply(
        &mut self,
        change: &PathChange,
        revmap: &RevMapStore,
        uuid: Option<uuid::Uuid>,
        store: &mut ObjectStore,
        report: &mut Report,
    ) -> Result<(), ConvertError> {
        let r = self.apply_change(change, revmap, uuid, store, report);
        report.absorb(r).map(drop)
    }

    fn apply_change(
        &mut self,
        change: &PathChange,
        revmap: &RevMapStore,
        uuid: Option<uuid::Uuid>,
        store: &mut ObjectStore,
        report: &mut Report,
    ) -> Result<(), Failure> {
        let path = change.path.as_slice();
        if path.is_empty() && !matches!(change.kind, ChangeKind::Modify) {
            return Err(self
                .integrity("the repository root cannot be added, copied or deleted".into())
                .into());
        }

        match change.kind {
            ChangeKind::Delete => {
                if self.remove(path, store)? {
                    Ok(())
                } else {
                    Err(self.conflict(path, ConflictKind::DeleteMissing).into())
                }
            }
            ChangeKind::Add => {
                if self.remove(path, store)? {
                    tracing::debug!(
                        "r{}: \"{}\" added over an existing node",
                        self.rev,
                        path.escape_ascii(),
                    );
                }
                match change.node_kind {
                    Some(NodeKind::Dir) => self.add_dir(path, Properties::new(), change, store),
                    Some(NodeKind::File) => {
                        self.write_file(path, FileState::empty(), change, None, store)
                    }
                    None => Err(self
                        .integrity(format!("added node \"{}\" has no kind", path.escape_ascii()))
                        .into()),
                }
            }
            ChangeKind::Copy(ref from) => {
                self.remove(path, store)?;
                self.copy(path, from, change, revmap, uuid, store)
            }
            ChangeKind::Modify => self.modify(path, change, store, report),
        }
    }

    /// Removes `path` from both trees, returning whether it existed.
    fn remove(&mut self, path: &[u8], store: &mut ObjectStore) -> Result<bool, ConvertError> {
        let Some((mode, _)) = self.meta.rm(path, store).map_err(store_error)? else {
            return Ok(false);
        };
        self.files.rm(path, store).map_err(store_error)?;
        self.ops.push(RootOp::DelPath {
            path: path.to_vec(),
            was_dir: mode.is_tree(),
        });
        Ok(true)
    }

    fn write_dir_props(
        &mut self,
        dir: &[u8],
        props: &Properties,
        store: &mut ObjectStore,
    ) -> Result<(), Failure> {
        let r = self.meta.mod_inline(
            &join_path(dir, PROPS_BLOB),
            EntryKind::Blob.into(),
            svn::prop_list::serialize(props),
            store,
        );
        self.tree_edit(r, dir).map(|_| ())
    }

    fn add_dir(
        &mut self,
        path: &[u8],
        mut props: Properties,
        change: &PathChange,
        store: &mut ObjectStore,
    ) -> Result<(), Failure> {
        if let Some(ref prop_change) = change.properties {
            prop_change.apply(&mut props);
        }
        self.write_dir_props(path, &props, store)?;
        self.ops.push(RootOp::AddDir {
            path: path.to_vec(),
        });
        Ok(())
    }

    fn copy(
        &mut self,
        path: &[u8],
        from: &CopyFrom,
        change: &PathChange,
        revmap: &RevMapStore,
        uuid: Option<uuid::Uuid>,
        store: &mut ObjectStore,
    ) -> Result<(), Failure> {
        let src_trees = revmap
            .root_trees(uuid, from.rev)
            .filter(|_| from.rev < self.rev)
            .ok_or_else(|| {
                self.integrity(format!(
                    "copy source r{} of \"{}\" has not been converted",
                    from.rev,
                    path.escape_ascii(),
                ))
            })?;
        let (src_mode, src_oid) = store
            .ls(src_trees.meta, &from.path)
            .map_err(store_error)?
            .ok_or_else(|| {
                self.integrity(format!(
                    "copy source \"{}\"@{} does not exist",
                    from.path.escape_ascii(),
                    from.rev,
                ))
            })?;

        if !src_mode.is_tree() {
            let state = FileState::load(store, src_mode, src_oid)?;
            return self.write_file(path, state, change, Some(from), store);
        }

        let r = self.meta.mod_oid(path, src_mode, src_oid, store);
        self.tree_edit(r, path)?;
        if let Some(ref prop_change) = change.properties {
            let mut props = read_dir_props(store, src_trees.meta, &from.path)?;
            prop_change.apply(&mut props);
            self.write_dir_props(path, &props, store)?;
        }

        if self.filemap.is_empty() {
            if let Some((mode, oid)) = store
                .ls(src_trees.files, &from.path)
                .map_err(store_error)?
            {
                self.files
                    .mod_oid(path, mode, oid, store)
                    .map_err(store_error)?;
            }
        } else {
            self.copy_filtered(src_oid, path, store)?;
        }

        self.ops.push(RootOp::CopyDir {
            path: path.to_vec(),
            from: from.clone(),
        });
        Ok(())
    }

    /// Copies the files of a meta subtree into the files tree, honoring the
    /// file map at the destination.
    fn copy_filtered(
        &mut self,
        meta_tree: ObjectId,
        dst: &[u8],
        store: &mut ObjectStore,
    ) -> Result<(), ConvertError> {
        for (name, mode, oid) in store.get_tree_entries(meta_tree).map_err(store_error)? {
            if name == PROPS_BLOB {
                continue;
            }
            let sub_path = join_path(dst, &name);
            if mode.is_tree() {
                self.copy_filtered(oid, &sub_path, store)?;
            } else if self.in_files_tree(&sub_path) {
                self.files
                    .mod_oid(&sub_path, mode, oid, store)
                    .map_err(store_error)?;
            }
        }
        Ok(())
    }

    fn modify(
        &mut self,
        path: &[u8],
        change: &PathChange,
        store: &mut ObjectStore,
        report: &mut Report,
    ) -> Result<(), Failure> {
        let existing = self.meta.ls_entry(path, store).map_err(store_error)?;
        let is_dir = match (change.node_kind, existing) {
            (Some(kind), _) => kind == NodeKind::Dir,
            (None, Some((mode, _))) => mode.is_tree(),
            (None, None) => change.text.is_none(),
        };

        if is_dir {
            let Some(ref prop_change) = change.properties else {
                return Ok(());
            };
            if !existing.is_some_and(|(mode, _)| mode.is_tree()) {
                report.note(self.conflict(path, ConflictKind::ModifyMissing));
                return self.add_dir(path, Properties::new(), change, store);
            }
            let mut props = Properties::new();
            if let Some((_, oid)) = self
                .meta
                .ls_file(&join_path(path, PROPS_BLOB), store)
                .map_err(store_error)?
            {
                let raw = store.get_blob(oid).map_err(store_error)?;
                props = svn::prop_list::deserialize(&raw).unwrap_or_default();
            }
            prop_change.apply(&mut props);
            self.write_dir_props(path, &props, store)?;
            self.ops.push(RootOp::DirProps {
                path: path.to_vec(),
            });
            return Ok(());
        }

        let state = match existing {
            Some((mode, oid)) if !mode.is_tree() => FileState::load(store, mode, oid)?,
            _ => {
                report.note(self.conflict(path, ConflictKind::ModifyMissing));
                if existing.is_some() {
                    self.remove(path, store)?;
                }
                FileState::empty()
            }
        };
        self.write_file(path, state, change, None, store)
    }

    fn write_file(
        &mut self,
        path: &[u8],
        mut state: FileState,
        change: &PathChange,
        copied_from: Option<&CopyFrom>,
        store: &mut ObjectStore,
    ) -> Result<(), Failure> {
        if let Some(ref prop_change) = change.properties {
            state.apply_props(prop_change);
        }
        if let Some(ref text) = change.text {
            state.content = if text.is_delta {
                svn::apply_delta(&text.data, &state.content).map_err(|e| {
                    self.integrity(format!(
                        "cannot apply text delta to \"{}\": {e}",
                        path.escape_ascii(),
                    ))
                })?
            } else {
                text.data.clone()
            };
        }

        let (mode, data) = state.into_entry();
        let oid = store.put_blob(data).map_err(store_error)?;
        let r = self.meta.mod_oid(path, mode, oid, store);
        self.tree_edit(r, path)?;
        if self.in_files_tree(path) {
            self.files
                .mod_oid(path, mode, oid, store)
                .map_err(store_error)?;
        }
        self.ops.push(RootOp::ModFile {
            path: path.to_vec(),
            mode,
            oid,
            copied_from: copied_from.cloned(),
        });
        Ok(())
    }

    /// Writes both trees, returning them with the operations applied.
    pub(crate) fn finish(
        mut self,
        store: &mut ObjectStore,
    ) -> Result<(RootTrees, Vec<RootOp>), ConvertError> {
        let meta = self.meta.materialize(store).map_err(store_error)?;
        let files = self.files.materialize(store).map_err(store_error)?;
        Ok((RootTrees { meta, files }, self.ops))
    }
}

#[cfg(test)]
mod tests {
    use gix_object::tree::EntryKind;

    use super::{RootEditor, RootOp, read_dir_props};
    use crate::convert::filemap::FileMap;
    use crate::convert::layout::Layout;
    use crate::convert::revmap::{RevMapStore, Transaction};
    use crate::errors::{Anomaly, ConflictKind, ConvertError, Report};
    use crate::git::ObjectStore;
    use crate::svn::{ChangeKind, CopyFrom, NodeKind, PathChange, PropChange, Properties, Text};

    struct Fixture {
        path: std::path::PathBuf,
        store: ObjectStore,
        revmap: RevMapStore,
    }

    impl Fixture {
        fn new() -> Self {
            let suffix: u64 = rand::random();
            let path = std::env::temp_dir().join(format!("svnbridge-root-{suffix:016x}"));
            let store = ObjectStore::init_or_open(&path, "refs/heads/default", 1 << 20).unwrap();
            let (revmap, _) = RevMapStore::open(&path.join("svnbridge").join("journal")).unwrap();
            Self {
                path,
                store,
                revmap,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn add(path: &str, kind: NodeKind, text: Option<&str>, props: &[(&str, &str)]) -> PathChange {
        let props: Properties = props
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        PathChange {
            path: path.into(),
            kind: ChangeKind::Add,
            node_kind: Some(kind),
            properties: Some(PropChange::full(&props)),
            text: text.map(|t| Text {
                is_delta: false,
                data: t.into(),
            }),
        }
    }

    fn run(
        fx: &mut Fixture,
        layout: &Layout,
        filemap: &FileMap,
        rev: u32,
        changes: &[PathChange],
    ) -> Result<(Vec<RootOp>, Report), ConvertError> {
        let mut report = Report::new();
        let base = fx.revmap.root_trees(None, rev.saturating_sub(1));
        let mut editor = RootEditor::new(layout, filemap, rev, base, &mut fx.store)?;
        for change in changes {
            editor.apply(change, &fx.revmap, None, &mut fx.store, &mut report)?;
        }
        let (trees, ops) = editor.finish(&mut fx.store)?;
        fx.revmap
            .commit(&Transaction {
                uuid: None,
                rev,
                trees,
                events: Vec::new(),
            })
            .unwrap();
        Ok((ops, report))
    }

    #[test]
    fn test_trees() {
        let mut fx = Fixture::new();
        let layout = Layout::standard("trunk", "branches", "tags", "default").unwrap();
        let filemap = FileMap::new([], ["secret"]);

        run(
            &mut fx,
            &layout,
            &filemap,
            1,
            &[
                add("trunk", NodeKind::Dir, None, &[("svn:ignore", "*.o\n")]),
                add("trunk/run.sh", NodeKind::File, Some("#!/bin/sh\n"), &[("svn:executable", "*")]),
                add("trunk/link", NodeKind::File, Some("link run.sh"), &[("svn:special", "*")]),
                add("trunk/secret", NodeKind::File, Some("x"), &[]),
            ],
        )
        .unwrap();

        let trees = fx.revmap.root_trees(None, 1).unwrap();
        let store = &fx.store;
        let (mode, oid) = store.ls(trees.files, b"trunk/run.sh").unwrap().unwrap();
        assert_eq!(mode.kind(), EntryKind::BlobExecutable);
        assert_eq!(store.get_blob(oid).unwrap(), b"#!/bin/sh\n");
        let (mode, oid) = store.ls(trees.files, b"trunk/link").unwrap().unwrap();
        assert_eq!(mode.kind(), EntryKind::Link);
        assert_eq!(store.get_blob(oid).unwrap(), b"run.sh");
        assert_eq!(store.ls(trees.files, b"trunk/secret").unwrap(), None);
        assert!(store.ls(trees.meta, b"trunk/secret").unwrap().is_some());
        assert_eq!(store.ls(trees.files, b"trunk/.svn").unwrap(), None);
        assert_eq!(
            read_dir_props(store, trees.meta, b"trunk").unwrap(),
            Properties::from([(b"svn:ignore".to_vec(), b"*.o\n".to_vec())]),
        );
        assert_eq!(read_dir_props(store, trees.meta, b"").unwrap(), Properties::new());
    }

    #[test]
    fn test_copy_and_conflicts() {
        let mut fx = Fixture::new();
        let layout = Layout::standard("trunk", "branches", "tags", "default").unwrap();
        let filemap = FileMap::default();

        run(
            &mut fx,
            &layout,
            &filemap,
            1,
            &[
                add("trunk", NodeKind::Dir, None, &[]),
                add("trunk/a", NodeKind::File, Some("a\n"), &[]),
            ],
        )
        .unwrap();

        let from = CopyFrom {
            rev: 1,
            path: b"trunk".to_vec(),
        };
        let (ops, report) = run(
            &mut fx,
            &layout,
            &filemap,
            2,
            &[
                PathChange {
                    path: b"tags/v1".to_vec(),
                    kind: ChangeKind::Copy(from.clone()),
                    node_kind: Some(NodeKind::Dir),
                    properties: None,
                    text: None,
                },
                PathChange::delete(b"trunk/missing"),
            ],
        )
        .unwrap();
        assert_eq!(
            ops,
            [RootOp::CopyDir {
                path: b"tags/v1".to_vec(),
                from,
            }],
        );
        assert_eq!(
            report.anomalies(),
            [Anomaly::ContentConflict {
                rev: 2,
                path: b"trunk/missing".to_vec(),
                kind: ConflictKind::DeleteMissing,
            }],
        );
        let trees = fx.revmap.root_trees(None, 2).unwrap();
        assert!(fx.store.ls(trees.files, b"tags/v1/a").unwrap().is_some());

        let bad_copy = PathChange {
            path: b"branches/x".to_vec(),
            kind: ChangeKind::Copy(CopyFrom {
                rev: 1,
                path: b"nowhere".to_vec(),
            }),
            node_kind: Some(NodeKind::Dir),
            properties: None,
            text: None,
        };
        assert!(matches!(
            run(&mut fx, &layout, &filemap, 3, &[bad_copy]),
            Err(ConvertError::SourceIntegrity { rev: 3, .. }),
        ));
    }
}
