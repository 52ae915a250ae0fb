use gix_hash::ObjectId;
use gix_object::tree::EntryMode;

use super::store::{ObjectStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TreeChange {
    /// A removed entry. Removed directories are reported once, without
    /// their contents.
    Deleted { path: Vec<u8>, mode: EntryMode },
    /// An added entry. Added directories are followed by their contents.
    Added {
        path: Vec<u8>,
        mode: EntryMode,
        oid: ObjectId,
    },
    /// A file whose content or mode changed.
    Modified {
        path: Vec<u8>,
        old_mode: EntryMode,
        new_mode: EntryMode,
        oid: ObjectId,
    },
}

impl TreeChange {
    pub(crate) fn path(&self) -> &[u8] {
        match self {
            Self::Deleted { path, .. } | Self::Added { path, .. } | Self::Modified { path, .. } => {
                path
            }
        }
    }
}

fn join(prefix: &[u8], name: &[u8]) -> Vec<u8> {
    let mut path = Vec::with_capacity(prefix.len() + 1 + name.len());
    if !prefix.is_empty() {
        path.extend(prefix);
        path.push(b'/');
    }
    path.extend(name);
    path
}

/// Compares two trees. A directory replacing a file (or the other way
/// round) is reported as a deletion followed by an addition.
pub(crate) fn diff_trees(
    store: &ObjectStore,
    old: ObjectId,
    new: ObjectId,
) -> Result<Vec<TreeChange>, StoreError> {
    let mut changes = Vec::new();
    diff_into(store, b"", old, new, &mut changes)?;
    Ok(changes)
}

fn diff_into(
    store: &ObjectStore,
    prefix: &[u8],
    old: ObjectId,
    new: ObjectId,
    changes: &mut Vec<TreeChange>,
) -> Result<(), StoreError> {
    if old == new {
        return Ok(());
    }
    let old_entries = store.get_tree_entries(old)?;
    let new_entries = store.get_tree_entries(new)?;

    // both lists are in git order, which differs from byte order for
    // directories, so look up by name instead of merging
    for (name, old_mode, _) in old_entries.iter() {
        let still_there = new_entries
            .iter()
            .any(|(n, m, _)| n == name && m.is_tree() == old_mode.is_tree());
        if !still_there {
            changes.push(TreeChange::Deleted {
                path: join(prefix, name),
                mode: *old_mode,
            });
        }
    }

    for (name, new_mode, new_oid) in new_entries.iter() {
        let path = join(prefix, name);
        let old_entry = old_entries
            .iter()
            .find(|(n, m, _)| n == name && m.is_tree() == new_mode.is_tree());
        match old_entry {
            None => add_recursive(store, path, *new_mode, *new_oid, changes)?,
            Some(&(_, old_mode, old_oid)) => {
                if new_mode.is_tree() {
                    diff_into(store, &path, old_oid, *new_oid, changes)?;
                } else if old_oid != *new_oid || old_mode != *new_mode {
                    changes.push(TreeChange::Modified {
                        path,
                        old_mode,
                        new_mode: *new_mode,
                        oid: *new_oid,
                    });
                }
            }
        }
    }

    Ok(())
}

fn add_recursive(
    store: &ObjectStore,
    path: Vec<u8>,
    mode: EntryMode,
    oid: ObjectId,
    changes: &mut Vec<TreeChange>,
) -> Result<(), StoreError> {
    changes.push(TreeChange::Added {
        path: path.clone(),
        mode,
        oid,
    });
    if mode.is_tree() {
        for (name, sub_mode, sub_oid) in store.get_tree_entries(oid)? {
            add_recursive(store, join(&path, &name), sub_mode, sub_oid, changes)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use gix_object::tree::EntryKind;

    use super::{TreeChange, diff_trees};
    use crate::git::{ObjectStore, TreeBuilder};

    #[test]
    fn test_diff_trees() {
        let suffix: u64 = rand::random();
        let path = std::env::temp_dir().join(format!("svnbridge-diff-{suffix:016x}"));
        let mut store = ObjectStore::init_or_open(&path, "refs/heads/default", 1 << 20).unwrap();

        let mut tb = TreeBuilder::new();
        for (p, data) in [
            (b"alpha".as_slice(), b"a".as_slice()),
            (b"gamma", b"g"),
            (b"x", b"file"),
            (b"d/keep", b"k"),
        ] {
            tb.mod_inline(p, EntryKind::Blob.into(), data.to_vec(), &mut store)
                .unwrap();
        }
        let old = tb.materialize(&mut store).unwrap();

        tb.rm(b"gamma", &mut store).unwrap();
        tb.rm(b"x", &mut store).unwrap();
        tb.mod_inline(b"x/y", EntryKind::Blob.into(), b"y".to_vec(), &mut store)
            .unwrap();
        tb.mod_inline(b"alpha", EntryKind::BlobExecutable.into(), b"a".to_vec(), &mut store)
            .unwrap();
        let new = tb.materialize(&mut store).unwrap();

        let changes = diff_trees(&store, old, new).unwrap();
        let summary: Vec<_> = changes
            .iter()
            .map(|c| {
                let tag = match c {
                    TreeChange::Deleted { .. } => 'D',
                    TreeChange::Added { .. } => 'A',
                    TreeChange::Modified { .. } => 'M',
                };
                (tag, String::from_utf8_lossy(c.path()).into_owned())
            })
            .collect();
        assert_eq!(
            summary,
            [
                ('D', "gamma".to_string()),
                ('D', "x".to_string()),
                ('M', "alpha".to_string()),
                ('A', "x".to_string()),
                ('A', "x/y".to_string()),
            ],
        );
        assert!(diff_trees(&store, new, new).unwrap().is_empty());

        std::fs::remove_dir_all(&path).unwrap();
    }
}
