use std::collections::BTreeMap;

use gix_hash::ObjectId;

use super::Options;
use super::branches::{BranchRegistry, LogicalBranch};
use super::layout::{BranchKind, strip_path_prefix};
use crate::errors::ConvertError;
use crate::git::{self, ObjectStore, StoreError};

/// Refs written by the previous run, with the value they were given.
const MANAGED_REFS: &str = "refs";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlannedRef {
    pub(crate) name: String,
    pub(crate) target: ObjectId,
    /// Index in the registry.
    pub(crate) branch: usize,
}

fn store_error(e: StoreError) -> ConvertError {
    tracing::error!("{e}");
    ConvertError::Aborted
}

fn kind_str(is_tag: bool) -> &'static str {
    if is_tag { "tag" } else { "branch" }
}

fn ref_target(branch: &LogicalBranch) -> Option<ObjectId> {
    if branch.kind == BranchKind::Tag {
        branch.tag_object.or(branch.tip)
    } else {
        branch.tip
    }
}

/// Names every branch that gets a ref, in creation order.
pub(crate) fn plan_refs(registry: &BranchRegistry, options: &Options) -> Vec<PlannedRef> {
    // sorted by name
    let mut ref_name_map: Vec<(String, usize, ObjectId)> = Vec::new();

    for (branch_i, branch) in registry.branches().iter().enumerate() {
        let Some(target) = ref_target(branch) else {
            continue;
        };
        let is_tag = branch.kind == BranchKind::Tag;
        if branch.closed_at.is_some()
            && ((is_tag && !options.keep_deleted_tags)
                || (!is_tag && !options.keep_deleted_branches))
        {
            continue;
        }

        let mut git_name = git::legalize_branch_name(&branch.name);
        if git_name.as_bytes() != branch.name.as_slice() {
            tracing::warn!(
                "{} \"{}\" named \"{}\" instead of \"{}\" due to invalid characters or sequences",
                kind_str(is_tag),
                branch.root.escape_ascii(),
                git_name.escape_default(),
                branch.name.escape_ascii(),
            );
        }
        if let Some(closed_at) = branch.closed_at {
            git_name = format!("deleted/{git_name}@{closed_at}");
        }

        let base_git_name = git_name.clone();
        let mut tries = 0;
        let i = loop {
            match ref_name_map.binary_search_by_key(&git_name.as_str(), |(n, ..)| n) {
                Ok(_) => {
                    tries += 1;
                    git_name = format!("{base_git_name}_{tries}");
                }
                Err(i) => break i,
            }
        };
        if git_name != base_git_name {
            tracing::warn!(
                "using {} name \"{}\" instead of \"{}\" to avoid repetition",
                kind_str(is_tag),
                git_name.escape_default(),
                base_git_name.escape_default(),
            );
        }
        ref_name_map.insert(i, (git_name, branch_i, target));
    }

    // git cannot have both "a" and "a/b"
    for i in 0..ref_name_map.len() {
        let git_name = ref_name_map[i].0.clone();
        let mut new_git_name = git_name.clone();
        let mut tries = 0;
        while ref_name_map.iter().enumerate().any(|(j, (check_name, ..))| {
            i != j && strip_path_prefix(check_name.as_bytes(), new_git_name.as_bytes()).is_some()
        }) {
            tries += 1;
            new_git_name = format!("{git_name}_{tries}");
        }
        if new_git_name != git_name {
            let is_tag = registry.branches()[ref_name_map[i].1].kind == BranchKind::Tag;
            tracing::warn!(
                "using {} name \"{}\" instead of \"{}\" to avoid prefix collision",
                kind_str(is_tag),
                new_git_name.escape_default(),
                git_name.escape_default(),
            );
            ref_name_map[i].0 = new_git_name;
        }
    }

    let mut planned: Vec<PlannedRef> = ref_name_map
        .into_iter()
        .map(|(name, branch, target)| {
            let prefix = if registry.branches()[branch].kind == BranchKind::Tag {
                "refs/tags"
            } else {
                "refs/heads"
            };
            PlannedRef {
                name: format!("{prefix}/{name}"),
                target,
                branch,
            }
        })
        .collect();
    planned.sort_by_key(|r| r.branch);
    planned
}

fn read_managed(store: &ObjectStore) -> Result<BTreeMap<String, ObjectId>, ConvertError> {
    let path = store.path().join("svnbridge").join(MANAGED_REFS);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            tracing::error!("failed to read {path:?}: {e}");
            return Err(ConvertError::Aborted);
        }
    };
    let mut managed = BTreeMap::new();
    for line in raw.lines() {
        let entry = line
            .split_once('\t')
            .and_then(|(name, oid)| Some((name, ObjectId::from_hex(oid.as_bytes()).ok()?)));
        let Some((name, oid)) = entry else {
            tracing::error!("malformed line in {path:?}: {line:?}");
            return Err(ConvertError::Aborted);
        };
        managed.insert(name.to_string(), oid);
    }
    Ok(managed)
}

/// Points the refs at the branch tips, leaving alone refs that were moved
/// since the previous run.
pub(crate) fn update_refs(
    store: &mut ObjectStore,
    registry: &BranchRegistry,
    options: &Options,
) -> Result<(), ConvertError> {
    let previous = read_managed(store)?;
    let planned = plan_refs(registry, options);

    let mut managed = String::new();
    for planned_ref in planned.iter() {
        let current = store.read_ref(&planned_ref.name).map_err(store_error)?;
        let expected = previous.get(&planned_ref.name).copied();
        if current.is_some() && current != expected && current != Some(planned_ref.target) {
            tracing::warn!(
                "not updating \"{}\" to {}, it was moved outside of the conversion",
                planned_ref.name,
                planned_ref.target,
            );
        } else if current != Some(planned_ref.target) {
            tracing::debug!("setting \"{}\" to {}", planned_ref.name, planned_ref.target);
            store
                .write_ref(&planned_ref.name, planned_ref.target)
                .map_err(store_error)?;
        }
        managed.push_str(&format!("{}\t{}\n", planned_ref.name, planned_ref.target));
    }

    for (name, old_target) in previous.iter() {
        if planned.iter().any(|r| r.name == *name) {
            continue;
        }
        match store.read_ref(name).map_err(store_error)? {
            Some(current) if current != *old_target => {
                tracing::warn!("not removing \"{name}\", it was moved outside of the conversion");
            }
            Some(_) => {
                tracing::debug!("removing \"{name}\"");
                store.delete_ref(name).map_err(store_error)?;
            }
            None => {}
        }
    }

    git::write_replace(
        &store.path().join("svnbridge").join(MANAGED_REFS),
        managed.as_bytes(),
    )
    .map_err(store_error)?;
    store.set_head(&options.head_ref()).map_err(store_error)?;
    Ok(())
}
