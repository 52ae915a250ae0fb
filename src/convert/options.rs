use super::filemap::FileMap;
use super::layout::Layout;

pub(crate) struct Options {
    pub(crate) layout: Layout,
    pub(crate) filemap: FileMap,
    pub(crate) keep_deleted_branches: bool,
    pub(crate) keep_deleted_tags: bool,
    pub(crate) stupid: bool,
    pub(crate) warn_unmapped: bool,
    pub(crate) obj_cache_size: usize,
}

impl Options {
    pub(crate) fn new(layout: Layout) -> Self {
        Self {
            layout,
            filemap: FileMap::default(),
            keep_deleted_branches: true,
            keep_deleted_tags: true,
            stupid: false,
            warn_unmapped: false,
            obj_cache_size: 64 * 1024 * 1024,
        }
    }

    #[inline]
    pub(crate) fn head_ref(&self) -> String {
        format!("refs/heads/{}", self.layout.trunk_name())
    }
}
