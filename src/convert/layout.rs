#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum BranchKind {
    Trunk,
    Branch,
    Tag,
}

impl BranchKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Trunk => "trunk",
            Self::Branch => "branch",
            Self::Tag => "tag",
        }
    }

    pub(crate) fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"trunk" => Some(Self::Trunk),
            b"branch" => Some(Self::Branch),
            b"tag" => Some(Self::Tag),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Mode {
    Standard {
        trunk: Vec<u8>,
        branches: Option<Vec<u8>>,
        tags: Option<Vec<u8>>,
    },
    Single {
        subdir: Vec<u8>,
    },
}

/// Maps source paths to logical branches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    mode: Mode,
    trunk_name: String,
}

/// Location of a path inside a branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BranchLoc<'a> {
    pub(crate) root: &'a [u8],
    pub(crate) kind: BranchKind,
    pub(crate) name: &'a [u8],
    pub(crate) rel: &'a [u8],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PathClass<'a> {
    Unmapped,
    /// A proper ancestor of the configured branch locations.
    Container,
    Branch(BranchLoc<'a>),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LayoutError {
    InvalidPath(String),
    Overlap(String, String),
    EmptyTrunkName,
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPath(p) => write!(f, "invalid layout path {p:?}"),
            Self::Overlap(a, b) => write!(f, "layout paths {a:?} and {b:?} overlap"),
            Self::EmptyTrunkName => write!(f, "trunk name cannot be empty"),
        }
    }
}

/// Checks that `path` is a relative path made of plain components.
fn valid_path(path: &str, allow_empty: bool) -> bool {
    if path.is_empty() {
        return allow_empty;
    }
    path.split('/')
        .all(|c| !matches!(c, "" | "." | ".." | ".svn"))
}

/// Returns the remainder of `path` below `prefix`, matching whole
/// components.
pub(crate) fn strip_path_prefix<'a>(path: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if prefix.is_empty() {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(b"/")
    }
}

pub(crate) fn join_path(prefix: &[u8], name: &[u8]) -> Vec<u8> {
    let mut path = Vec::with_capacity(prefix.len() + 1 + name.len());
    path.extend(prefix);
    if !prefix.is_empty() && !name.is_empty() {
        path.push(b'/');
    }
    path.extend(name);
    path
}

fn is_proper_ancestor(ancestor: &[u8], path: &[u8]) -> bool {
    ancestor.len() < path.len() && strip_path_prefix(path, ancestor).is_some()
}

impl Layout {
    pub(crate) fn standard(
        trunk: &str,
        branches: &str,
        tags: &str,
        trunk_name: &str,
    ) -> Result<Self, LayoutError> {
        for p in [trunk, branches, tags] {
            if !valid_path(p, p != trunk) {
                return Err(LayoutError::InvalidPath(p.into()));
            }
        }
        let set: Vec<&str> = [trunk, branches, tags]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        for (i, a) in set.iter().enumerate() {
            for b in set[(i + 1)..].iter() {
                if strip_path_prefix(a.as_bytes(), b.as_bytes()).is_some()
                    || strip_path_prefix(b.as_bytes(), a.as_bytes()).is_some()
                {
                    return Err(LayoutError::Overlap((*a).into(), (*b).into()));
                }
            }
        }
        if trunk_name.is_empty() {
            return Err(LayoutError::EmptyTrunkName);
        }

        let non_empty = |p: &str| (!p.is_empty()).then(|| p.as_bytes().to_vec());
        Ok(Self {
            mode: Mode::Standard {
                trunk: trunk.as_bytes().to_vec(),
                branches: non_empty(branches),
                tags: non_empty(tags),
            },
            trunk_name: trunk_name.into(),
        })
    }

    pub(crate) fn single(subdir: &str, trunk_name: &str) -> Result<Self, LayoutError> {
        let subdir = subdir.trim_matches('/');
        if !valid_path(subdir, true) {
            return Err(LayoutError::InvalidPath(subdir.into()));
        }
        if trunk_name.is_empty() {
            return Err(LayoutError::EmptyTrunkName);
        }
        Ok(Self {
            mode: Mode::Single {
                subdir: subdir.as_bytes().to_vec(),
            },
            trunk_name: trunk_name.into(),
        })
    }

    #[inline]
    pub(crate) fn trunk_name(&self) -> &str {
        &self.trunk_name
    }

    pub(crate) fn classify<'a>(&'a self, path: &'a [u8]) -> PathClass<'a> {
        match self.mode {
            Mode::Single { ref subdir } => {
                if let Some(rel) = strip_path_prefix(path, subdir) {
                    PathClass::Branch(BranchLoc {
                        root: subdir,
                        kind: BranchKind::Trunk,
                        name: self.trunk_name.as_bytes(),
                        rel,
                    })
                } else if is_proper_ancestor(path, subdir) {
                    PathClass::Container
                } else {
                    PathClass::Unmapped
                }
            }
            Mode::Standard {
                ref trunk,
                ref branches,
                ref tags,
            } => {
                if let Some(rel) = strip_path_prefix(path, trunk) {
                    return PathClass::Branch(BranchLoc {
                        root: trunk,
                        kind: BranchKind::Trunk,
                        name: self.trunk_name.as_bytes(),
                        rel,
                    });
                }

                let containers = [
                    (branches.as_deref(), BranchKind::Branch),
                    (tags.as_deref(), BranchKind::Tag),
                ];
                for (container, kind) in containers {
                    let Some(container) = container else {
                        continue;
                    };
                    match strip_path_prefix(path, container) {
                        Some(b"") => return PathClass::Container,
                        Some(rest) => {
                            let name_len = rest
                                .iter()
                                .position(|&c| c == b'/')
                                .unwrap_or(rest.len());
                            let root_len = path.len() - rest.len() + name_len;
                            return PathClass::Branch(BranchLoc {
                                root: &path[..root_len],
                                kind,
                                name: &rest[..name_len],
                                rel: rest.get((name_len + 1)..).unwrap_or_default(),
                            });
                        }
                        None => {}
                    }
                }

                let is_container = std::iter::once(trunk.as_slice())
                    .chain(branches.as_deref())
                    .chain(tags.as_deref())
                    .any(|prefix| is_proper_ancestor(path, prefix));
                if is_container {
                    PathClass::Container
                } else {
                    PathClass::Unmapped
                }
            }
        }
    }
}
