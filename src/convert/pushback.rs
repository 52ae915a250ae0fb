use gix_hash::ObjectId;
use gix_object::tree::EntryKind;

use super::externals::{self, EXTERNALS_FILE, ExternalsMap};
use super::layout::{BranchKind, join_path};
use super::root_tree::read_dir_props;
use super::{Converter, MetaMaker, Options, close_reader, open_reader, refs};
use crate::errors::{Anomaly, ConvertError, Report};
use crate::git::{ObjectStore, StoreError, TreeChange, diff_trees};
use crate::svn::{CommitInfo, DumpFileEditor, EditOp, EditorError, SourceEditor, sort_ops};
use crate::term_out::ProgressPrint;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PushState {
    Idle,
    Diffing,
    Replaying,
    Committed(u32),
    Failed,
}

impl std::fmt::Display for PushState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Diffing => f.write_str("diffing"),
            Self::Replaying => f.write_str("replaying"),
            Self::Committed(rev) => write!(f, "committed as r{rev}"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

fn store_error(e: StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError::Aborted
}

/// A commit being pushed.
struct PushJob {
    commit: ObjectId,
    state: PushState,
}

impl PushJob {
    fn new(commit: ObjectId) -> Self {
        Self {
            commit,
            state: PushState::Idle,
        }
    }

    fn set_state(&mut self, state: PushState) {
        tracing::debug!("{}: {} -> {state}", self.commit, self.state);
        self.state = state;
    }

    fn fail(&mut self, report: &mut Report, reason: String) {
        self.set_state(PushState::Failed);
        report.note(Anomaly::PushConflict {
            commit: self.commit,
            reason,
        });
    }
}

/// Live branch with commits to push.
struct PushBranch {
    root: Vec<u8>,
    ref_name: String,
    /// Oldest first.
    commits: Vec<ObjectId>,
}

fn decode_externals(
    store: &ObjectStore,
    tree: ObjectId,
) -> Result<Result<ExternalsMap, String>, ConvertError> {
    let Some((_, oid)) = store.ls(tree, EXTERNALS_FILE).map_err(store_error)? else {
        return Ok(Ok(ExternalsMap::new()));
    };
    let raw = store.get_blob(oid).map_err(store_error)?;
    Ok(externals::decode(&raw).map_err(|e| {
        format!(
            "cannot decode {}: \"{}\"",
            EXTERNALS_FILE.escape_ascii(),
            e.line.escape_ascii(),
        )
    }))
}

/// Turns the difference between two commits of a branch into source
/// edits. The outer error is fatal, the inner one rejects the commit.
fn edit_ops(
    store: &ObjectStore,
    root: &[u8],
    base_meta: ObjectId,
    parent_tree: ObjectId,
    tree: ObjectId,
) -> Result<Result<Vec<EditOp>, String>, ConvertError> {
    let mut ops = Vec::new();
    let mut externals_changed = false;

    for change in diff_trees(store, parent_tree, tree).map_err(store_error)? {
        if change.path() == EXTERNALS_FILE {
            externals_changed = true;
            continue;
        }
        let path = join_path(root, change.path());
        match change {
            TreeChange::Deleted { .. } => ops.push(EditOp::Delete { path }),
            TreeChange::Added { mode, .. } if mode.is_tree() => {
                let exists = store
                    .ls(base_meta, &path)
                    .map_err(store_error)?
                    .is_some_and(|(mode, _)| mode.is_tree());
                if !exists {
                    ops.push(EditOp::AddDir {
                        path,
                        props: Default::default(),
                    });
                }
            }
            TreeChange::Added { mode, oid, .. } => {
                let data = store.get_blob(oid).map_err(store_error)?;
                let existing = store.ls(base_meta, &path).map_err(store_error)?;
                let executable = mode.kind() == EntryKind::BlobExecutable;
                let symlink = mode.kind() == EntryKind::Link;
                if existing.is_some_and(|(mode, _)| !mode.is_tree()) {
                    ops.push(EditOp::ModifyFile {
                        path,
                        data,
                        executable,
                        symlink,
                    });
                } else {
                    ops.push(EditOp::AddFile {
                        path,
                        data,
                        executable,
                        symlink,
                    });
                }
            }
            TreeChange::Modified { new_mode, oid, .. } => {
                if new_mode.kind() == EntryKind::Commit {
                    return Ok(Err(format!(
                        "submodule \"{}\" cannot be pushed",
                        path.escape_ascii(),
                    )));
                }
                ops.push(EditOp::ModifyFile {
                    path,
                    data: store.get_blob(oid).map_err(store_error)?,
                    executable: new_mode.kind() == EntryKind::BlobExecutable,
                    symlink: new_mode.kind() == EntryKind::Link,
                });
            }
        }
    }

    if externals_changed {
        let old = match decode_externals(store, parent_tree)? {
            Ok(map) => map,
            Err(reason) => return Ok(Err(reason)),
        };
        let new = match decode_externals(store, tree)? {
            Ok(map) => map,
            Err(reason) => return Ok(Err(reason)),
        };
        let mut dirs: Vec<&Vec<u8>> = old.keys().chain(new.keys()).collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            let old_defs = old.get(dir).map(Vec::as_slice).unwrap_or_default();
            let new_defs = new.get(dir).map(Vec::as_slice).unwrap_or_default();
            if old_defs == new_defs {
                continue;
            }
            let rel: &[u8] = if dir == b"." { b"" } else { dir };
            let path = join_path(root, rel);
            let mut props = read_dir_props(store, base_meta, &path)?;
            if new_defs.is_empty() {
                props.remove(b"svn:externals".as_slice());
            } else {
                props.insert(b"svn:externals".to_vec(), externals::to_property(new_defs));
            }
            ops.push(EditOp::SetDirProps { path, props });
        }
    }

    sort_ops(&mut ops);
    Ok(Ok(ops))
}

impl Converter<'_> {
    /// Finds the commits of a branch ref that were not converted from the
    /// source, checking they extend the branch tip.
    fn pending_commits(
        &self,
        ref_name: &str,
        tip: ObjectId,
    ) -> Result<Result<Vec<ObjectId>, (ObjectId, String)>, ConvertError> {
        let Some(head) = self.store.read_ref(ref_name).map_err(store_error)? else {
            return Ok(Ok(Vec::new()));
        };
        let head = self.store.peel_to_commit(head).map_err(store_error)?;

        let mut commits = Vec::new();
        let mut cur = head;
        while self.revmap.lookup_commit(cur).is_none() {
            let data = self.store.get_commit(cur).map_err(store_error)?;
            if data.parents.len() > 1 {
                return Ok(Err((cur, "merge commits cannot be pushed".into())));
            }
            commits.push(cur);
            match data.parents.first() {
                Some(&parent) => cur = parent,
                None => {
                    return Ok(Err((cur, "no converted ancestor".into())));
                }
            }
        }
        if cur != tip {
            let oldest = commits.last().copied().unwrap_or(head);
            return Ok(Err((
                oldest,
                format!("based on {cur}, but the branch tip is {tip}"),
            )));
        }
        commits.reverse();
        Ok(Ok(commits))
    }

    fn push_branches(&mut self) -> Result<Vec<PushBranch>, ConvertError> {
        let mut branches = Vec::new();
        for planned in refs::plan_refs(&self.registry, self.options) {
            let branch = &self.registry.branches()[planned.branch];
            if branch.kind == BranchKind::Tag || branch.closed_at.is_some() {
                continue;
            }
            let Some(tip) = branch.tip else {
                continue;
            };
            let root = branch.root.clone();
            match self.pending_commits(&planned.name, tip)? {
                Ok(commits) if commits.is_empty() => {}
                Ok(commits) => branches.push(PushBranch {
                    root,
                    ref_name: planned.name,
                    commits,
                }),
                Err((commit, reason)) => self.report.note(Anomaly::PushConflict { commit, reason }),
            }
        }
        Ok(branches)
    }

    /// Replays one commit and converts the resulting revision.
    fn push_commit(
        &mut self,
        editor: &mut dyn SourceEditor,
        src_path: &std::path::Path,
        root: &[u8],
        job: &mut PushJob,
    ) -> Result<(), ConvertError> {
        let uuid = self.revmap.uuid();
        let Some(base_rev) = self.revmap.last_converted(uuid) else {
            job.fail(&mut self.report, "nothing converted yet".into());
            return Ok(());
        };
        let Some(base_trees) = self.revmap.root_trees(uuid, base_rev) else {
            job.fail(&mut self.report, "nothing converted yet".into());
            return Ok(());
        };

        job.set_state(PushState::Diffing);
        let data = self.store.get_commit(job.commit).map_err(store_error)?;
        let Some(&parent) = data.parents.first() else {
            job.fail(&mut self.report, "root commits cannot be pushed".into());
            return Ok(());
        };
        let parent_tree = self.store.get_commit(parent).map_err(store_error)?.tree;
        let ops = match edit_ops(&self.store, root, base_trees.meta, parent_tree, data.tree)? {
            Ok(ops) if ops.is_empty() => {
                job.fail(&mut self.report, "commit has no changes".into());
                return Ok(());
            }
            Ok(ops) => ops,
            Err(reason) => {
                job.fail(&mut self.report, reason);
                return Ok(());
            }
        };

        job.set_state(PushState::Replaying);
        let info = CommitInfo {
            author: data.author_name.clone(),
            timestamp: data.author_time,
            message: data.message.clone(),
        };
        let new_rev = match editor.commit(base_rev, &info, &ops) {
            Ok(new_rev) => new_rev,
            Err(e @ (EditorError::OutOfDate { .. } | EditorError::Rejected(_))) => {
                job.fail(&mut self.report, e.to_string());
                return Ok(());
            }
            Err(EditorError::Io(e)) => {
                tracing::error!("failed to write source repository: {e}");
                return Err(ConvertError::Aborted);
            }
        };
        tracing::info!(
            "pushed {} as r{new_rev} with {} operation(s)",
            job.commit,
            ops.len(),
        );

        let mut reader = open_reader(src_path, new_rev)?;
        self.fetch_from(&mut reader, Some((root, job.commit)))?;
        close_reader(reader)?;
        job.set_state(PushState::Committed(new_rev));
        Ok(())
    }

    pub(super) fn run_pushback(
        &mut self,
        editor: &mut dyn SourceEditor,
        src_path: &std::path::Path,
    ) -> Result<usize, ConvertError> {
        if self.revmap.is_empty() || editor.uuid() != self.revmap.uuid() {
            tracing::error!("the source repository has not been converted into this repository");
            return Err(ConvertError::Aborted);
        }

        let next = self.next_revision();
        if editor.head_revision() >= next {
            tracing::info!("fetching r{next} to r{} first", editor.head_revision());
            let mut reader = open_reader(src_path, next)?;
            self.fetch_from(&mut reader, None)?;
            close_reader(reader)?;
        }

        let mut pushed = 0;
        for branch in self.push_branches()? {
            tracing::info!(
                "pushing {} commit(s) of \"{}\"",
                branch.commits.len(),
                branch.ref_name,
            );
            for &commit in branch.commits.iter() {
                self.progress_print
                    .set_progress(format!("pushing {commit} on {}", branch.ref_name));
                let mut job = PushJob::new(commit);
                self.push_commit(editor, src_path, &branch.root, &mut job)?;
                let PushState::Committed(rev) = job.state else {
                    break;
                };
                pushed += 1;
                if self.revmap.lookup_commit(commit).is_none() {
                    // the rest of the branch no longer extends its tip
                    tracing::warn!(
                        "r{rev} was converted into a different commit than {commit}, \
                         stopping \"{}\"",
                        branch.ref_name,
                    );
                    break;
                }
            }
        }
        Ok(pushed)
    }
}

/// Replays the commits added to the converted branches into the source
/// dump file, converting each new revision back.
pub(crate) fn pushback(
    progress_print: &ProgressPrint,
    options: &Options,
    meta_maker: &dyn MetaMaker,
    src_path: &std::path::Path,
    dst_path: &std::path::Path,
) -> Result<Report, ConvertError> {
    let mut converter = Converter::open(progress_print, options, meta_maker, dst_path)?;
    let mut editor = DumpFileEditor::open(src_path).map_err(|e| {
        tracing::error!("{e}");
        ConvertError::Aborted
    })?;

    let pushed = converter.run_pushback(&mut editor, src_path)?;
    tracing::info!("pushed {pushed} commit(s)");

    converter.update_refs()?;
    Ok(converter.finish())
}
