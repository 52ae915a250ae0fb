use std::collections::BTreeMap;

use gix_hash::ObjectId;
use gix_object::tree::EntryKind;

use super::branches::{BranchPlan, BranchRegistry};
use super::externals::{self, EXTERNALS_FILE, ExternalsMap};
use super::filemap::FileMap;
use super::layout::{BranchKind, join_path};
use super::provenance::{self, Provenance};
use super::revmap::{JournalEvent, RootTrees};
use super::root_tree::{PROPS_BLOB, RootOp};
use super::{MetaMaker, Options};
use crate::errors::{Anomaly, ConvertError, Report};
use crate::git::{self, ObjectStore, StoreError, TreeBuilder};
use crate::svn::{self, Properties};

fn store_error(e: StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError::Aborted
}

/// Input of a tree strategy for one branch in one revision.
pub(crate) struct TreeInput<'a> {
    pub(crate) root: &'a [u8],
    /// Files tree of the repository after the revision.
    pub(crate) files_tree: ObjectId,
    /// Tree of the current branch tip, `None` when the branch starts over.
    pub(crate) tip_tree: Option<ObjectId>,
    pub(crate) ops: &'a [RootOp],
    pub(crate) filemap: &'a FileMap,
}

/// Produces the tree of a branch after a revision. Implementations must
/// agree on every result.
pub(crate) trait TreeStrategy {
    fn branch_tree(
        &self,
        input: &TreeInput<'_>,
        store: &mut ObjectStore,
    ) -> Result<TreeBuilder, StoreError>;

    /// Whether the returned tree never carries the externals file of the
    /// previous commit.
    fn rebuilds_externals(&self) -> bool;
}

fn snapshot(
    store: &ObjectStore,
    files_tree: ObjectId,
    root: &[u8],
) -> Result<TreeBuilder, StoreError> {
    match store.ls(files_tree, root)? {
        Some((mode, oid)) if mode.is_tree() => Ok(TreeBuilder::with_base(oid)),
        _ => Ok(TreeBuilder::new()),
    }
}

/// Applies the changes of the branch to the tree of its tip.
pub(crate) struct Incremental;

impl TreeStrategy for Incremental {
    fn branch_tree(
        &self,
        input: &TreeInput<'_>,
        store: &mut ObjectStore,
    ) -> Result<TreeBuilder, StoreError> {
        let Some(tip_tree) = input.tip_tree else {
            return snapshot(store, input.files_tree, input.root);
        };

        let mut tree = TreeBuilder::with_base(tip_tree);
        for op in input.ops.iter() {
            match op {
                RootOp::DelPath { path, .. } => {
                    tree.rm(path, store)?;
                }
                RootOp::ModFile { path, mode, oid, .. } => {
                    if input.filemap.includes(path) {
                        tree.mod_oid(path, *mode, *oid, store)?;
                    }
                }
                RootOp::CopyDir { path, .. } => {
                    tree.rm(path, store)?;
                    let full_path = join_path(input.root, path);
                    if let Some((mode, oid)) = store.ls(input.files_tree, &full_path)? {
                        tree.mod_oid(path, mode, oid, store)?;
                    }
                }
                RootOp::AddDir { .. } | RootOp::DirProps { .. } => {}
            }
        }
        Ok(tree)
    }

    fn rebuilds_externals(&self) -> bool {
        false
    }
}

/// Takes the branch subtree of the files tree as is.
pub(crate) struct Stupid;

impl TreeStrategy for Stupid {
    fn branch_tree(
        &self,
        input: &TreeInput<'_>,
        store: &mut ObjectStore,
    ) -> Result<TreeBuilder, StoreError> {
        snapshot(store, input.files_tree, input.root)
    }

    fn rebuilds_externals(&self) -> bool {
        true
    }
}

/// Collects `svn:externals` below a directory of the meta tree.
fn collect_externals(
    store: &ObjectStore,
    tree: ObjectId,
    rel: &[u8],
    map: &mut ExternalsMap,
    errors: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<(), StoreError> {
    for (name, mode, oid) in store.get_tree_entries(tree)? {
        if mode.is_tree() {
            collect_externals(store, oid, &join_path(rel, &name), map, errors)?;
            continue;
        }
        if name != PROPS_BLOB {
            continue;
        }
        let raw = store.get_blob(oid)?;
        let props = svn::prop_list::deserialize(&raw).unwrap_or_default();
        let Some(value) = props.get(b"svn:externals".as_slice()) else {
            continue;
        };
        match externals::parse(value) {
            Ok(defs) if defs.is_empty() => {}
            Ok(defs) => {
                let key = if rel.is_empty() { b".".to_vec() } else { rel.to_vec() };
                map.insert(key, defs);
            }
            Err(e) => errors.push((rel.to_vec(), e.line)),
        }
    }
    Ok(())
}

/// Revision being converted.
pub(crate) struct RevisionCtx<'a> {
    pub(crate) uuid: Option<uuid::Uuid>,
    pub(crate) rev: u32,
    pub(crate) properties: &'a Properties,
    pub(crate) trees: RootTrees,
}

/// Creates the commits and tags of one revision from the branch plans.
pub(crate) struct CommitGraphBuilder<'a> {
    options: &'a Options,
    meta_maker: &'a dyn MetaMaker,
    strategy: &'a dyn TreeStrategy,
}

impl<'a> CommitGraphBuilder<'a> {
    pub(crate) fn new(
        options: &'a Options,
        meta_maker: &'a dyn MetaMaker,
        strategy: &'a dyn TreeStrategy,
    ) -> Self {
        Self {
            options,
            meta_maker,
            strategy,
        }
    }

    /// Returns the journal events of the revision. `adopt` names a commit
    /// pushed to the source for the branch at the given root, reused when
    /// it matches the converted result.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        &self,
        ctx: &RevisionCtx<'_>,
        plans: &BTreeMap<Vec<u8>, BranchPlan>,
        registry: &BranchRegistry,
        adopt: Option<(&[u8], ObjectId)>,
        store: &mut ObjectStore,
        report: &mut Report,
    ) -> Result<Vec<JournalEvent>, ConvertError> {
        let mut events = Vec::new();
        for (root, plan) in plans.iter() {
            if plan.close_existing {
                tracing::debug!(
                    "r{}: closing {} \"{}\"",
                    ctx.rev,
                    plan.kind.as_str(),
                    root.escape_ascii(),
                );
                events.push(JournalEvent::Close { root: root.clone() });
            }

            let (parents, tip_tree) = if let Some(ref open) = plan.open {
                tracing::debug!(
                    "r{}: opening {} \"{}\"",
                    ctx.rev,
                    plan.kind.as_str(),
                    root.escape_ascii(),
                );
                events.push(JournalEvent::Open {
                    kind: plan.kind,
                    created_at: ctx.rev,
                    name: plan.name.clone(),
                    root: root.clone(),
                });
                (open.copy_parent.into_iter().collect::<Vec<_>>(), None)
            } else if plan.close_existing || registry.live(root).is_none() {
                continue;
            } else {
                let tip = registry.live(root).and_then(|branch| branch.tip);
                let tip_tree = match tip {
                    Some(tip) => Some(store.get_commit(tip).map_err(store_error)?.tree),
                    None => None,
                };
                let mut parents: Vec<ObjectId> = tip.into_iter().collect();
                parents.extend(plan.merges.iter().copied());
                (parents, tip_tree)
            };

            let tree = self.branch_tree(ctx, root, plan, tip_tree, store, report)?;

            let needs_commit = match plan.open {
                Some(ref open) => open.copied.is_some() || tree != store.empty_tree_oid(),
                None => Some(tree) != tip_tree || !plan.merges.is_empty(),
            };
            if !needs_commit {
                continue;
            }
            if plan.kind == BranchKind::Tag && plan.open.is_none() {
                tracing::warn!(
                    "r{}: tag \"{}\" modified after its creation",
                    ctx.rev,
                    root.escape_ascii(),
                );
            }

            let adopted = adopt
                .filter(|&(adopt_root, _)| adopt_root == root.as_slice() && plan.open.is_none())
                .map(|(_, commit)| commit)
                .map(|commit| self.check_adoption(commit, tree, &parents, store))
                .transpose()?
                .flatten();
            let commit = match adopted {
                Some(commit) => {
                    tracing::info!("r{}: adopted pushed commit {commit}", ctx.rev);
                    commit
                }
                None => self.make_commit(ctx, root, tree, parents, store)?,
            };
            events.push(JournalEvent::Map {
                commit,
                root: root.clone(),
            });

            if plan.kind == BranchKind::Tag {
                let object = self.make_tag(ctx, root, &plan.name, commit, store)?;
                events.push(JournalEvent::Tag {
                    object,
                    root: root.clone(),
                });
            }
        }
        Ok(events)
    }

    fn branch_tree(
        &self,
        ctx: &RevisionCtx<'_>,
        root: &[u8],
        plan: &BranchPlan,
        tip_tree: Option<ObjectId>,
        store: &mut ObjectStore,
        report: &mut Report,
    ) -> Result<ObjectId, ConvertError> {
        let input = TreeInput {
            root,
            files_tree: ctx.trees.files,
            tip_tree,
            ops: &plan.ops,
            filemap: &self.options.filemap,
        };
        let mut tree = self
            .strategy
            .branch_tree(&input, store)
            .map_err(store_error)?;

        let changed = plan.open.is_some() || plan.dir_changed;
        if changed || self.strategy.rebuilds_externals() {
            let mut map = ExternalsMap::new();
            let mut errors = Vec::new();
            if let Some((mode, oid)) = store.ls(ctx.trees.meta, root).map_err(store_error)? {
                if mode.is_tree() {
                    collect_externals(store, oid, b"", &mut map, &mut errors)
                        .map_err(store_error)?;
                }
            }
            if changed {
                for (dir, line) in errors {
                    report.note(Anomaly::ExternalSyntax {
                        rev: ctx.rev,
                        dir: join_path(root, &dir),
                        line,
                    });
                }
            }
            match externals::encode(&map) {
                Some(data) => {
                    tree.mod_inline(EXTERNALS_FILE, EntryKind::Blob.into(), data, store)
                        .map_err(store_error)?;
                }
                None => {
                    tree.rm(EXTERNALS_FILE, store).map_err(store_error)?;
                }
            }
        }

        tree.materialize(store).map_err(store_error)
    }

    /// Returns the pushed commit when it has the converted tree and
    /// parents.
    fn check_adoption(
        &self,
        commit: ObjectId,
        tree: ObjectId,
        parents: &[ObjectId],
        store: &ObjectStore,
    ) -> Result<Option<ObjectId>, ConvertError> {
        let data = store.get_commit(commit).map_err(store_error)?;
        if data.tree == tree && data.parents == parents {
            Ok(Some(commit))
        } else {
            tracing::warn!(
                "converted tree differs from pushed commit {commit}, creating a new commit",
            );
            Ok(None)
        }
    }

    fn make_commit(
        &self,
        ctx: &RevisionCtx<'_>,
        root: &[u8],
        tree: ObjectId,
        parents: Vec<ObjectId>,
        store: &mut ObjectStore,
    ) -> Result<ObjectId, ConvertError> {
        let meta = self
            .meta_maker
            .commit_meta(ctx.uuid.as_ref(), ctx.rev, root, ctx.properties)
            .map_err(|e| {
                tracing::error!("r{}: {e}", ctx.rev);
                ConvertError::Aborted
            })?;
        let provenance = Provenance {
            uuid: ctx.uuid,
            path: root.to_vec(),
            rev: ctx.rev,
        };

        let commit = store
            .put(gix_object::Commit {
                tree,
                parents: smallvec::SmallVec::from_vec(parents),
                author: meta.author,
                committer: meta.committer,
                encoding: None,
                message: meta.message.into(),
                extra_headers: vec![(provenance::HEADER.into(), provenance.format().into())],
            })
            .map_err(store_error)?;
        tracing::debug!(
            "r{}: commit {commit} on \"{}\"",
            ctx.rev,
            root.escape_ascii(),
        );
        Ok(commit)
    }

    fn make_tag(
        &self,
        ctx: &RevisionCtx<'_>,
        root: &[u8],
        name: &[u8],
        target: ObjectId,
        store: &mut ObjectStore,
    ) -> Result<ObjectId, ConvertError> {
        let meta = self
            .meta_maker
            .tag_meta(ctx.uuid.as_ref(), ctx.rev, root, ctx.properties)
            .map_err(|e| {
                tracing::error!("r{}: {e}", ctx.rev);
                ConvertError::Aborted
            })?;
        store
            .put(gix_object::Tag {
                target,
                target_kind: gix_object::Kind::Commit,
                name: git::legalize_branch_name(name).into(),
                tagger: meta.tagger,
                message: meta.message.into(),
                pgp_signature: None,
            })
            .map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use gix_object::tree::EntryKind;

    use super::{Incremental, Stupid, TreeInput, TreeStrategy};
    use crate::convert::filemap::FileMap;
    use crate::convert::root_tree::RootOp;
    use crate::git::{ObjectStore, TreeBuilder};

    #[test]
    fn test_strategies_agree() {
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("svnbridge-builder-{suffix:016x}"));
        let mut store = ObjectStore::init_or_open(&path, "refs/heads/default", 1 << 20).unwrap();
        let blob = |store: &mut ObjectStore, data: &[u8]| store.put_blob(data.to_vec()).unwrap();
        let mode = EntryKind::Blob.into();

        let a = blob(&mut store, b"a\n");
        let b = blob(&mut store, b"b\n");
        let c = blob(&mut store, b"c\n");

        let mut tip = TreeBuilder::new();
        tip.mod_oid(b"a", mode, a, &mut store).unwrap();
        tip.mod_oid(b"d/b", mode, b, &mut store).unwrap();
        let tip_tree = tip.materialize(&mut store).unwrap();

        let mut files = TreeBuilder::new();
        files.mod_oid(b"trunk/a", mode, c, &mut store).unwrap();
        files.mod_oid(b"other/x", mode, b, &mut store).unwrap();
        let files_tree = files.materialize(&mut store).unwrap();

        let filemap = FileMap::default();
        let ops = [
            RootOp::ModFile {
                path: b"a".to_vec(),
                mode,
                oid: c,
                copied_from: None,
            },
            RootOp::DelPath {
                path: b"d".to_vec(),
                was_dir: true,
            },
        ];
        let input = TreeInput {
            root: b"trunk",
            files_tree,
            tip_tree: Some(tip_tree),
            ops: &ops,
            filemap: &filemap,
        };

        let incremental = Incremental
            .branch_tree(&input, &mut store)
            .unwrap()
            .materialize(&mut store)
            .unwrap();
        let stupid = Stupid
            .branch_tree(&input, &mut store)
            .unwrap()
            .materialize(&mut store)
            .unwrap();
        assert_eq!(incremental, stupid);
        assert_eq!(store.ls(stupid, b"a").unwrap(), Some((mode, c)));
        assert_eq!(store.ls(stupid, b"d").unwrap(), None);

        std::fs::remove_dir_all(&path).unwrap();
    }
}
