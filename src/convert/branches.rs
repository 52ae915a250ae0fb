use std::collections::BTreeMap;

use gix_hash::ObjectId;

use super::layout::{BranchKind, Layout, PathClass, join_path, strip_path_prefix};
use super::revmap::{JournalEvent, RevMapStore, Transaction};
use super::root_tree::{PROPS_BLOB, RootOp};
use crate::errors::ConvertError;
use crate::git::ObjectStore;
use crate::svn::CopyFrom;

/// A source directory mapped to a git ref over a range of revisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LogicalBranch {
    pub(crate) name: Vec<u8>,
    pub(crate) kind: BranchKind,
    pub(crate) root: Vec<u8>,
    pub(crate) created_at: u32,
    pub(crate) closed_at: Option<u32>,
    pub(crate) tip: Option<ObjectId>,
    pub(crate) tip_rev: Option<u32>,
    pub(crate) tag_object: Option<ObjectId>,
}

/// Every branch ever opened, in creation order, with an index of the live
/// ones by root path. Only changed by replaying journal transactions.
#[derive(Default)]
pub(crate) struct BranchRegistry {
    branches: Vec<LogicalBranch>,
    live: BTreeMap<Vec<u8>, usize>,
}

impl BranchRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&mut self, txn: &Transaction) {
        for event in txn.events.iter() {
            match event {
                JournalEvent::Close { root } => {
                    if let Some(i) = self.live.remove(root) {
                        self.branches[i].closed_at = Some(txn.rev);
                    }
                }
                JournalEvent::Open {
                    kind,
                    created_at,
                    name,
                    root,
                } => {
                    if let Some(i) = self.live.remove(root) {
                        self.branches[i].closed_at = Some(txn.rev);
                    }
                    self.live.insert(root.clone(), self.branches.len());
                    self.branches.push(LogicalBranch {
                        name: name.clone(),
                        kind: *kind,
                        root: root.clone(),
                        created_at: *created_at,
                        closed_at: None,
                        tip: None,
                        tip_rev: None,
                        tag_object: None,
                    });
                }
                JournalEvent::Map { commit, root } => {
                    if let Some(&i) = self.live.get(root) {
                        self.branches[i].tip = Some(*commit);
                        self.branches[i].tip_rev = Some(txn.rev);
                    }
                }
                JournalEvent::Tag { object, root } => {
                    if let Some(&i) = self.live.get(root) {
                        self.branches[i].tag_object = Some(*object);
                    }
                }
            }
        }
    }

    #[inline]
    pub(crate) fn branches(&self) -> &[LogicalBranch] {
        &self.branches
    }

    pub(crate) fn live(&self, root: &[u8]) -> Option<&LogicalBranch> {
        self.live.get(root).map(|&i| &self.branches[i])
    }

    fn live_under<'a>(&'a self, dir: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.live
            .keys()
            .filter(move |root| strip_path_prefix(root, dir).is_some())
            .map(Vec::as_slice)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OpenSpec {
    /// Commit the new branch starts from.
    pub(crate) copy_parent: Option<ObjectId>,
    pub(crate) copied: Option<CopyFrom>,
}

/// What happens to one branch root in a revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BranchPlan {
    pub(crate) kind: BranchKind,
    pub(crate) name: Vec<u8>,
    pub(crate) close_existing: bool,
    pub(crate) open: Option<OpenSpec>,
    /// Changes with paths relative to the branch root.
    pub(crate) ops: Vec<RootOp>,
    pub(crate) dir_changed: bool,
    pub(crate) merges: Vec<ObjectId>,
}

impl BranchPlan {
    fn new(kind: BranchKind, name: &[u8]) -> Self {
        Self {
            kind,
            name: name.to_vec(),
            close_existing: false,
            open: None,
            ops: Vec::new(),
            dir_changed: false,
            merges: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.open = None;
        self.ops.clear();
        self.dir_changed = false;
        self.merges.clear();
    }
}

fn relocate(op: &RootOp, rel: &[u8]) -> RootOp {
    let path = rel.to_vec();
    match op {
        RootOp::DelPath { was_dir, .. } => RootOp::DelPath {
            path,
            was_dir: *was_dir,
        },
        RootOp::ModFile {
            mode,
            oid,
            copied_from,
            ..
        } => RootOp::ModFile {
            path,
            mode: *mode,
            oid: *oid,
            copied_from: copied_from.clone(),
        },
        RootOp::AddDir { .. } => RootOp::AddDir { path },
        RootOp::CopyDir { from, .. } => RootOp::CopyDir {
            path,
            from: from.clone(),
        },
        RootOp::DirProps { .. } => RootOp::DirProps { path },
    }
}

/// Groups the root operations of a revision by branch and derives the
/// structural events: branch creation, deletion and merges.
pub(crate) struct BranchDetector<'a> {
    layout: &'a Layout,
    registry: &'a BranchRegistry,
    revmap: &'a RevMapStore,
    uuid: Option<uuid::Uuid>,
    rev: u32,
    warn_unmapped: bool,
    plans: BTreeMap<Vec<u8>, BranchPlan>,
}

impl<'a> BranchDetector<'a> {
    pub(crate) fn new(
        layout: &'a Layout,
        registry: &'a BranchRegistry,
        revmap: &'a RevMapStore,
        uuid: Option<uuid::Uuid>,
        rev: u32,
        warn_unmapped: bool,
    ) -> Self {
        Self {
            layout,
            registry,
            revmap,
            uuid,
            rev,
            warn_unmapped,
            plans: BTreeMap::new(),
        }
    }

    pub(crate) fn detect(
        mut self,
        ops: &[RootOp],
        meta_tree: ObjectId,
        store: &ObjectStore,
    ) -> Result<BTreeMap<Vec<u8>, BranchPlan>, ConvertError> {
        let layout = self.layout;
        for op in ops.iter() {
            match layout.classify(op.path()) {
                PathClass::Unmapped => {
                    if self.warn_unmapped {
                        tracing::warn!(
                            "r{}: ignoring unmapped path \"{}\"",
                            self.rev,
                            op.path().escape_ascii(),
                        );
                    }
                }
                PathClass::Container => self.container_op(op, meta_tree, store)?,
                PathClass::Branch(loc) if loc.rel.is_empty() => match op {
                    RootOp::DelPath { was_dir: true, .. } => self.close(loc.root),
                    RootOp::AddDir { .. } => self.open(loc.root, loc.kind, loc.name, None),
                    RootOp::CopyDir { from, .. } => {
                        self.open(loc.root, loc.kind, loc.name, Some(from.clone()));
                    }
                    RootOp::DirProps { .. } => self.change(loc.root, loc.kind, loc.name, op, b""),
                    RootOp::DelPath { .. } | RootOp::ModFile { .. } => {
                        tracing::debug!(
                            "r{}: ignoring file at branch location \"{}\"",
                            self.rev,
                            op.path().escape_ascii(),
                        );
                    }
                },
                PathClass::Branch(loc) => self.change(loc.root, loc.kind, loc.name, op, loc.rel),
            }
        }
        Ok(self.plans)
    }

    fn container_op(
        &mut self,
        op: &RootOp,
        meta_tree: ObjectId,
        store: &ObjectStore,
    ) -> Result<(), ConvertError> {
        match op {
            RootOp::DelPath {
                path,
                was_dir: true,
            } => {
                let mut roots: Vec<Vec<u8>> =
                    self.registry.live_under(path).map(<[u8]>::to_vec).collect();
                roots.extend(
                    self.plans
                        .iter()
                        .filter(|(root, plan)| {
                            plan.open.is_some() && strip_path_prefix(root, path).is_some()
                        })
                        .map(|(root, _)| root.clone()),
                );
                roots.sort();
                roots.dedup();
                for root in roots {
                    self.close(&root);
                }
            }
            RootOp::CopyDir { path, from } => {
                let mut found = Vec::new();
                self.find_roots(store, meta_tree, path, &mut found)?;
                for (root, kind, name) in found {
                    let suffix = strip_path_prefix(&root, path).unwrap_or_default();
                    let copied = CopyFrom {
                        rev: from.rev,
                        path: join_path(&from.path, suffix),
                    };
                    self.open(&root, kind, &name, Some(copied));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Finds branch locations below a container directory of a meta tree.
    fn find_roots(
        &self,
        store: &ObjectStore,
        meta_tree: ObjectId,
        dir: &[u8],
        found: &mut Vec<(Vec<u8>, BranchKind, Vec<u8>)>,
    ) -> Result<(), ConvertError> {
        let entries = store
            .ls(meta_tree, dir)
            .and_then(|entry| match entry {
                Some((mode, oid)) if mode.is_tree() => store.get_tree_entries(oid),
                _ => Ok(Vec::new()),
            })
            .map_err(|e| {
                tracing::error!("{e}");
                ConvertError::Aborted
            })?;

        for (name, mode, _) in entries {
            if !mode.is_tree() || name == PROPS_BLOB {
                continue;
            }
            let child = join_path(dir, &name);
            match self.layout.classify(&child) {
                PathClass::Container => self.find_roots(store, meta_tree, &child, found)?,
                PathClass::Branch(loc) if loc.rel.is_empty() => {
                    found.push((loc.root.to_vec(), loc.kind, loc.name.to_vec()));
                }
                PathClass::Branch(_) | PathClass::Unmapped => {}
            }
        }
        Ok(())
    }

    fn plan(&mut self, root: &[u8], kind: BranchKind, name: &[u8]) -> &mut BranchPlan {
        self.plans
            .entry(root.to_vec())
            .or_insert_with(|| BranchPlan::new(kind, name))
    }

    fn close(&mut self, root: &[u8]) {
        let (kind, name, live) = match self.registry.live(root) {
            Some(branch) => (branch.kind, branch.name.clone(), true),
            None => match self.plans.get(root) {
                Some(plan) => (plan.kind, plan.name.clone(), false),
                None => return,
            },
        };
        let plan = self.plan(root, kind, &name);
        plan.reset();
        plan.close_existing = live;
    }

    fn copy_parent(&self, from: &CopyFrom) -> Option<ObjectId> {
        match self.layout.classify(&from.path) {
            PathClass::Branch(src) => self.revmap.lookup_branch(self.uuid, src.root, from.rev),
            PathClass::Container | PathClass::Unmapped => None,
        }
    }

    fn open(&mut self, root: &[u8], kind: BranchKind, name: &[u8], copied: Option<CopyFrom>) {
        let copy_parent = copied.as_ref().and_then(|from| self.copy_parent(from));
        let live = self.registry.live(root).is_some();
        let plan = self.plan(root, kind, name);
        plan.reset();
        plan.close_existing |= live;
        plan.open = Some(OpenSpec {
            copy_parent,
            copied,
        });
    }

    fn change(&mut self, root: &[u8], kind: BranchKind, name: &[u8], op: &RootOp, rel: &[u8]) {
        let tip = self.registry.live(root).map(|branch| branch.tip);
        let merge = match op {
            RootOp::ModFile {
                copied_from: Some(from),
                ..
            }
            | RootOp::CopyDir { from, .. } => match self.layout.classify(&from.path) {
                PathClass::Branch(src) if src.root != root => {
                    self.revmap.lookup_branch(self.uuid, src.root, from.rev)
                }
                _ => None,
            },
            _ => None,
        };

        let rev = self.rev;
        let plan = self.plan(root, kind, name);
        if plan.open.is_none() && (tip.is_none() || plan.close_existing) {
            tracing::debug!(
                "r{rev}: opening {} \"{}\" without a copy",
                kind.as_str(),
                root.escape_ascii(),
            );
            plan.open = Some(OpenSpec {
                copy_parent: None,
                copied: None,
            });
        }

        if plan.open.is_none() {
            if let Some(merge) = merge {
                if tip != Some(Some(merge)) && !plan.merges.contains(&merge) {
                    tracing::debug!(
                        "r{rev}: merging {merge} into \"{}\"",
                        root.escape_ascii(),
                    );
                    plan.merges.push(merge);
                }
            }
        }
        plan.dir_changed |= matches!(
            op,
            RootOp::DelPath { was_dir: true, .. }
                | RootOp::AddDir { .. }
                | RootOp::CopyDir { .. }
                | RootOp::DirProps { .. }
        );
        plan.ops.push(relocate(op, rel));
    }
}

#[cfg(test)]
mod tests {
    use gix_hash::ObjectId;
    use gix_object::tree::EntryKind;

    use super::{BranchDetector, BranchRegistry, OpenSpec};
    use crate::convert::layout::{BranchKind, Layout};
    use crate::convert::revmap::{JournalEvent, RevMapStore, RootTrees, Transaction};
    use crate::convert::root_tree::RootOp;
    use crate::git::ObjectStore;
    use crate::svn::CopyFrom;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[n; 20])
    }

    fn fixture() -> (std::path::PathBuf, ObjectStore, RevMapStore) {
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("svnbridge-branches-{suffix:016x}"));
        let store = ObjectStore::init_or_open(&path, "refs/heads/default", 1 << 20).unwrap();
        let (revmap, _) = RevMapStore::open(&path.join("svnbridge").join("journal")).unwrap();
        (path, store, revmap)
    }

    fn record(revmap: &mut RevMapStore, registry: &mut BranchRegistry, txn: Transaction) {
        revmap.commit(&txn).unwrap();
        registry.apply(&txn);
    }

    fn trees(store: &ObjectStore) -> RootTrees {
        RootTrees {
            meta: store.empty_tree_oid(),
            files: store.empty_tree_oid(),
        }
    }

    #[test]
    fn test_registry() {
        let mut registry = BranchRegistry::new();
        let trees = RootTrees {
            meta: oid(9),
            files: oid(9),
        };
        let open = |rev| JournalEvent::Open {
            kind: BranchKind::Branch,
            created_at: rev,
            name: b"x".to_vec(),
            root: b"branches/x".to_vec(),
        };
        registry.apply(&Transaction {
            uuid: None,
            rev: 1,
            trees,
            events: vec![
                open(1),
                JournalEvent::Map {
                    commit: oid(1),
                    root: b"branches/x".to_vec(),
                },
            ],
        });
        registry.apply(&Transaction {
            uuid: None,
            rev: 2,
            trees,
            events: vec![
                JournalEvent::Close {
                    root: b"branches/x".to_vec(),
                },
                open(2),
            ],
        });

        let branches = registry.branches();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].closed_at, Some(2));
        assert_eq!(branches[0].tip, Some(oid(1)));
        assert_eq!(branches[1].closed_at, None);
        assert_eq!(branches[1].tip, None);
        assert_eq!(registry.live(b"branches/x"), Some(&branches[1]));
    }

    #[test]
    fn test_detect() {
        let (path, store, mut revmap) = fixture();
        let mut registry = BranchRegistry::new();
        let layout = Layout::standard("trunk", "branches", "tags", "default").unwrap();

        record(
            &mut revmap,
            &mut registry,
            Transaction {
                uuid: None,
                rev: 1,
                trees: trees(&store),
                events: vec![
                    JournalEvent::Open {
                        kind: BranchKind::Trunk,
                        created_at: 1,
                        name: b"default".to_vec(),
                        root: b"trunk".to_vec(),
                    },
                    JournalEvent::Map {
                        commit: oid(1),
                        root: b"trunk".to_vec(),
                    },
                    JournalEvent::Open {
                        kind: BranchKind::Branch,
                        created_at: 1,
                        name: b"b".to_vec(),
                        root: b"branches/b".to_vec(),
                    },
                    JournalEvent::Map {
                        commit: oid(2),
                        root: b"branches/b".to_vec(),
                    },
                ],
            },
        );

        let from_trunk = CopyFrom {
            rev: 1,
            path: b"trunk".to_vec(),
        };
        let ops = [
            RootOp::CopyDir {
                path: b"tags/v1".to_vec(),
                from: from_trunk.clone(),
            },
            RootOp::ModFile {
                path: b"branches/b/f".to_vec(),
                mode: EntryKind::Blob.into(),
                oid: oid(7),
                copied_from: Some(CopyFrom {
                    rev: 1,
                    path: b"trunk/f".to_vec(),
                }),
            },
            RootOp::DelPath {
                path: b"junk".to_vec(),
                was_dir: true,
            },
        ];
        let plans = BranchDetector::new(&layout, &registry, &revmap, None, 2, false)
            .detect(&ops, store.empty_tree_oid(), &store)
            .unwrap();

        assert_eq!(
            plans.keys().cloned().collect::<Vec<_>>(),
            [b"branches/b".to_vec(), b"tags/v1".to_vec()],
        );
        let tag = &plans[b"tags/v1".as_slice()];
        assert_eq!(tag.kind, BranchKind::Tag);
        assert_eq!(
            tag.open,
            Some(OpenSpec {
                copy_parent: Some(oid(1)),
                copied: Some(from_trunk),
            }),
        );
        let branch = &plans[b"branches/b".as_slice()];
        assert_eq!(branch.open, None);
        assert_eq!(branch.merges, [oid(1)]);
        assert_eq!(branch.ops[0].path(), b"f");
        assert!(!branch.dir_changed);

        let ops = [RootOp::DelPath {
            path: b"branches".to_vec(),
            was_dir: true,
        }];
        let plans = BranchDetector::new(&layout, &registry, &revmap, None, 2, false)
            .detect(&ops, store.empty_tree_oid(), &store)
            .unwrap();
        assert_eq!(plans.len(), 1);
        assert!(plans[b"branches/b".as_slice()].close_existing);

        std::fs::remove_dir_all(&path).unwrap();
    }
}
