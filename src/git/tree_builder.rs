use gix_hash::ObjectId;
use gix_object::tree::{EntryKind, EntryMode};

use super::store::{ObjectStore, StoreError};
use crate::FHashMap;

/// Incrementally edits a tree, loading subtrees from the store on demand
/// and writing only the modified ones back.
pub(crate) struct TreeBuilder {
    root: TreeBuilderRoot,
}

impl TreeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            root: TreeBuilderRoot::Tree(TreeBuilderNode::empty()),
        }
    }

    pub(crate) fn with_base(base: ObjectId) -> Self {
        Self {
            root: TreeBuilderRoot::Ext(base),
        }
    }

    pub(crate) fn mod_oid(
        &mut self,
        path: &[u8],
        mode: EntryMode,
        oid: ObjectId,
        store: &mut ObjectStore,
    ) -> Result<(), StoreError> {
        let (node, entry_name) = self.find_entry(path, true, true, store)?;

        node.entries
            .insert(entry_name.to_vec(), TreeBuilderEntry::Entry(mode, oid));
        Ok(())
    }

    pub(crate) fn mod_inline(
        &mut self,
        path: &[u8],
        mode: EntryMode,
        blob: Vec<u8>,
        store: &mut ObjectStore,
    ) -> Result<ObjectId, StoreError> {
        let blob_oid = store.put_blob(blob)?;
        self.mod_oid(path, mode, blob_oid, store)?;
        Ok(blob_oid)
    }

    pub(crate) fn rm(
        &mut self,
        path: &[u8],
        store: &mut ObjectStore,
    ) -> Result<Option<(EntryMode, ObjectId)>, StoreError> {
        let Some((node, entry_name)) = self.find_existing(path, true, store)? else {
            return Ok(None);
        };
        match node.entries.remove(entry_name) {
            None => Ok(None),
            Some(TreeBuilderEntry::Entry(mode, oid)) => Ok(Some((mode, oid))),
            Some(TreeBuilderEntry::Tree(sub_node)) => Ok(Self::build_node(&sub_node, store)?
                .map(|oid| (EntryKind::Tree.into(), oid))),
        }
    }

    /// Looks up a file entry; directories yield `None`.
    pub(crate) fn ls_file(
        &mut self,
        path: &[u8],
        store: &mut ObjectStore,
    ) -> Result<Option<(EntryMode, ObjectId)>, StoreError> {
        Ok(self
            .ls_entry(path, store)?
            .filter(|(mode, _)| !mode.is_tree()))
    }

    /// Looks up any entry, writing pending changes below it when it is a
    /// modified directory.
    pub(crate) fn ls_entry(
        &mut self,
        path: &[u8],
        store: &mut ObjectStore,
    ) -> Result<Option<(EntryMode, ObjectId)>, StoreError> {
        if path.is_empty() {
            return Ok(Some((EntryKind::Tree.into(), self.materialize(store)?)));
        }
        let Some((node, entry_name)) = self.find_existing(path, false, store)? else {
            return Ok(None);
        };
        match node.entries.get(entry_name) {
            None => Ok(None),
            Some(&TreeBuilderEntry::Entry(mode, oid)) => Ok(Some((mode, oid))),
            Some(TreeBuilderEntry::Tree(sub_node)) => Ok(Some((
                EntryKind::Tree.into(),
                Self::build_node(sub_node, store)?.unwrap_or(store.empty_tree_oid()),
            ))),
        }
    }

    fn find_existing<'a, 'b>(
        &'a mut self,
        path: &'b [u8],
        modify: bool,
        store: &mut ObjectStore,
    ) -> Result<Option<(&'a mut TreeBuilderNode, &'b [u8])>, StoreError> {
        match self.find_entry_inner(path, modify, false, store) {
            Ok(found) => Ok(Some(found)),
            Err(FindError::Missing) => Ok(None),
            Err(FindError::Store(e)) => Err(e),
        }
    }

    fn find_entry<'a, 'b>(
        &'a mut self,
        path: &'b [u8],
        modify: bool,
        create: bool,
        store: &mut ObjectStore,
    ) -> Result<(&'a mut TreeBuilderNode, &'b [u8]), StoreError> {
        self.find_entry_inner(path, modify, create, store)
            .map_err(|e| match e {
                FindError::Missing => StoreError::InvalidPath {
                    path: path.to_vec(),
                },
                FindError::Store(e) => e,
            })
    }

    fn find_entry_inner<'a, 'b>(
        &'a mut self,
        path: &'b [u8],
        modify: bool,
        create: bool,
        store: &mut ObjectStore,
    ) -> Result<(&'a mut TreeBuilderNode, &'b [u8]), FindError> {
        let mut comps = path.split(|&c| c == b'/');
        let last_comp = match comps.next_back() {
            Some(last) if !last.is_empty() => last,
            _ => {
                return Err(FindError::Store(StoreError::InvalidPath {
                    path: path.to_vec(),
                }));
            }
        };

        if let TreeBuilderRoot::Ext(tree_oid) = self.root {
            self.root = TreeBuilderRoot::Tree(Self::read_tree(tree_oid, store)?);
        }
        let TreeBuilderRoot::Tree(ref mut root) = self.root else {
            unreachable!();
        };

        let mut cur_node = root;
        for dir_comp in comps {
            cur_node.modified |= modify;
            if create && !cur_node.entries.contains_key(dir_comp) {
                cur_node.entries.insert(
                    dir_comp.to_vec(),
                    TreeBuilderEntry::Tree(TreeBuilderNode::empty()),
                );
            }
            let entry = cur_node
                .entries
                .get_mut(dir_comp)
                .ok_or(FindError::Missing)?;
            if let TreeBuilderEntry::Entry(mode, oid) = *entry {
                if !mode.is_tree() {
                    return Err(if create {
                        FindError::Store(StoreError::ParentPathIsNotDir {
                            path: path.to_vec(),
                        })
                    } else {
                        FindError::Missing
                    });
                }
                *entry = TreeBuilderEntry::Tree(Self::read_tree(oid, store)?);
            }
            cur_node = match *entry {
                TreeBuilderEntry::Tree(ref mut sub_node) => sub_node,
                TreeBuilderEntry::Entry(..) => unreachable!(),
            };
        }

        cur_node.modified |= modify;
        Ok((cur_node, last_comp))
    }

    fn read_tree(tree_oid: ObjectId, store: &ObjectStore) -> Result<TreeBuilderNode, StoreError> {
        let entries = store.get_tree_entries(tree_oid)?;
        let base_oid = (!entries.is_empty()).then_some(tree_oid);
        let entries = entries
            .into_iter()
            .map(|(name, mode, oid)| (name, TreeBuilderEntry::Entry(mode, oid)))
            .collect();

        Ok(TreeBuilderNode {
            modified: false,
            base_oid,
            entries,
        })
    }

    /// Writes pending changes and returns the root tree id. The builder
    /// stays usable.
    pub(crate) fn materialize(&mut self, store: &mut ObjectStore) -> Result<ObjectId, StoreError> {
        let tree_oid = match self.root {
            TreeBuilderRoot::Tree(ref node) => {
                Self::build_node(node, store)?.unwrap_or(store.empty_tree_oid())
            }
            TreeBuilderRoot::Ext(tree_oid) => return Ok(tree_oid),
        };
        self.root = TreeBuilderRoot::Ext(tree_oid);
        Ok(tree_oid)
    }

    fn build_node(
        node: &TreeBuilderNode,
        store: &mut ObjectStore,
    ) -> Result<Option<ObjectId>, StoreError> {
        if !node.modified {
            return Ok(node.base_oid);
        }

        let mut entries = Vec::new();
        for (k, v) in node.entries.iter() {
            match *v {
                TreeBuilderEntry::Tree(ref sub_node) => {
                    if let Some(sub_tree_oid) = Self::build_node(sub_node, store)? {
                        entries.push(gix_object::tree::Entry {
                            mode: EntryKind::Tree.into(),
                            filename: k.as_slice().into(),
                            oid: sub_tree_oid,
                        });
                    }
                }
                TreeBuilderEntry::Entry(mode, oid) => {
                    if !mode.is_tree() || oid != store.empty_tree_oid() {
                        entries.push(gix_object::tree::Entry {
                            mode,
                            filename: k.as_slice().into(),
                            oid,
                        });
                    }
                }
            }
        }

        if entries.is_empty() {
            Ok(None)
        } else {
            entries.sort();
            store.put(gix_object::Tree { entries }).map(Some)
        }
    }
}

enum FindError {
    Missing,
    Store(StoreError),
}

impl From<StoreError> for FindError {
    #[inline]
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

enum TreeBuilderRoot {
    Tree(TreeBuilderNode),
    Ext(ObjectId),
}

enum TreeBuilderEntry {
    Tree(TreeBuilderNode),
    Entry(EntryMode, ObjectId),
}

struct TreeBuilderNode {
    modified: bool,
    base_oid: Option<ObjectId>,
    entries: FHashMap<Vec<u8>, TreeBuilderEntry>,
}

impl TreeBuilderNode {
    fn empty() -> Self {
        Self {
            modified: false,
            base_oid: None,
            entries: FHashMap::default(),
        }
    }
}
