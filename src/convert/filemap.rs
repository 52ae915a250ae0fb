use super::layout::strip_path_prefix;

/// Branch-relative include/exclude prefixes.
#[derive(Clone, Debug, Default)]
pub(crate) struct FileMap {
    include: Vec<Vec<u8>>,
    exclude: Vec<Vec<u8>>,
}

impl FileMap {
    pub(crate) fn new<'a>(
        include: impl IntoIterator<Item = &'a str>,
        exclude: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let clean = |p: &str| p.trim_matches('/').as_bytes().to_vec();
        Self {
            include: include.into_iter().map(clean).collect(),
            exclude: exclude.into_iter().map(clean).collect(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    fn longest_match(list: &[Vec<u8>], rel: &[u8]) -> Option<usize> {
        list.iter()
            .filter(|prefix| strip_path_prefix(rel, prefix).is_some())
            .map(Vec::len)
            .max()
    }

    pub(crate) fn includes(&self, rel: &[u8]) -> bool {
        let excluded = Self::longest_match(&self.exclude, rel);
        let included = if self.include.is_empty() {
            Some(0)
        } else {
            Self::longest_match(&self.include, rel)
        };
        match (included, excluded) {
            (None, _) => {
                // ancestors of an included path must stay so the walk can
                // reach it
                self.include
                    .iter()
                    .any(|prefix| strip_path_prefix(prefix, rel).is_some())
                    && excluded.is_none()
            }
            (Some(_), None) => true,
            (Some(inc), Some(exc)) => inc > exc,
        }
    }

    /// Whether everything below `rel` is included, so a whole subtree can
    /// be taken without walking it.
    pub(crate) fn includes_all_below(&self, rel: &[u8]) -> bool {
        if !self.includes(rel) {
            return false;
        }
        let below = |prefix: &Vec<u8>| {
            strip_path_prefix(prefix, rel).is_some_and(|rest| !rest.is_empty())
        };
        !self.exclude.iter().any(below)
            && (self.include.is_empty()
                || Self::longest_match(&self.include, rel).is_some())
    }
}
