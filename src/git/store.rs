use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use gix_hash::ObjectId;
use gix_object::tree::{EntryKind, EntryMode};

#[derive(Debug)]
pub(crate) enum StoreError {
    CreateDir {
        path: PathBuf,
        error: std::io::Error,
    },
    CreateFile {
        path: PathBuf,
        error: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        error: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        error: std::io::Error,
    },
    RemoveFile {
        path: PathBuf,
        error: std::io::Error,
    },
    Rename {
        source_path: PathBuf,
        dest_path: PathBuf,
        error: std::io::Error,
    },
    NotARepository {
        path: PathBuf,
    },
    NotConverted {
        path: PathBuf,
    },
    ObjectNotFound {
        id: ObjectId,
    },
    ParseObject {
        id: ObjectId,
    },
    UnexpectedObjectKind {
        id: ObjectId,
        kind: gix_object::Kind,
    },
    ParentPathIsNotDir {
        path: Vec<u8>,
    },
    InvalidPath {
        path: Vec<u8>,
    },
    Hash,
}

impl std::error::Error for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CreateDir {
                ref path,
                ref error,
            } => write!(f, "failed to create directory {path:?}: {error}"),
            Self::CreateFile {
                ref path,
                ref error,
            } => write!(f, "failed to create file {path:?}: {error}"),
            Self::ReadFile {
                ref path,
                ref error,
            } => write!(f, "failed to read file {path:?}: {error}"),
            Self::WriteFile {
                ref path,
                ref error,
            } => write!(f, "failed to write file {path:?}: {error}"),
            Self::RemoveFile {
                ref path,
                ref error,
            } => write!(f, "failed to remove file {path:?}: {error}"),
            Self::Rename {
                ref source_path,
                ref dest_path,
                ref error,
            } => write!(
                f,
                "failed to rename {source_path:?} to {dest_path:?}: {error}"
            ),
            Self::NotARepository { ref path } => {
                write!(f, "{path:?} is not a bare git repository")
            }
            Self::NotConverted { ref path } => {
                write!(f, "{path:?} does not hold a conversion")
            }
            Self::ObjectNotFound { id } => write!(f, "object {id} not found"),
            Self::ParseObject { id } => write!(f, "failed to parse object {id}"),
            Self::UnexpectedObjectKind { id, kind } => write!(f, "object {id} is a {kind}"),
            Self::ParentPathIsNotDir { ref path } => write!(
                f,
                "parent path of \"{}\" is not a directory",
                path.escape_ascii(),
            ),
            Self::InvalidPath { ref path } => {
                write!(f, "invalid tree path \"{}\"", path.escape_ascii())
            }
            Self::Hash => write!(f, "failed to hash object"),
        }
    }
}

/// Commit fields needed by the converter, read from a raw commit object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CommitData {
    pub(crate) tree: ObjectId,
    pub(crate) parents: Vec<ObjectId>,
    pub(crate) author_name: Vec<u8>,
    pub(crate) author_email: Vec<u8>,
    pub(crate) author_time: i64,
    pub(crate) extra_headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) message: Vec<u8>,
}

impl CommitData {
    pub(crate) fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.extra_headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }
}

fn parse_commit(raw: &[u8]) -> Option<CommitData> {
    let header_end = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .map_or(raw.len(), |i| i + 1);
    let (header, message) = raw.split_at(header_end);
    let message = message.strip_prefix(b"\n").unwrap_or(message);

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut extra_headers = Vec::new();
    for line in header.split(|&c| c == b'\n') {
        if line.is_empty() || line.starts_with(b" ") {
            // continuation of a multi-line header
            continue;
        }
        let sep = line.iter().position(|&c| c == b' ')?;
        let (key, value) = (&line[..sep], &line[(sep + 1)..]);
        match key {
            b"tree" => tree = Some(ObjectId::from_hex(value).ok()?),
            b"parent" => parents.push(ObjectId::from_hex(value).ok()?),
            b"author" => author = Some(value),
            b"committer" | b"encoding" | b"gpgsig" | b"mergetag" => {}
            _ => extra_headers.push((key.to_vec(), value.to_vec())),
        }
    }

    let author = author?;
    let email_start = author.iter().position(|&c| c == b'<')?;
    let email_end = author.iter().rposition(|&c| c == b'>')?;
    let author_time = std::str::from_utf8(author.get((email_end + 1)..)?)
        .ok()?
        .split_ascii_whitespace()
        .next()?
        .parse()
        .ok()?;

    Some(CommitData {
        tree: tree?,
        parents,
        author_name: author[..email_start].trim_ascii_end().to_vec(),
        author_email: author.get((email_start + 1)..email_end)?.to_vec(),
        author_time,
        extra_headers,
        message: message.to_vec(),
    })
}

/// Bare repository written with loose objects and loose refs.
pub(crate) struct ObjectStore {
    path: PathBuf,
    hash_kind: gix_hash::Kind,
    empty_tree_oid: ObjectId,
    unsynced: Vec<PathBuf>,
    tree_cache: RefCell<lru_mem::LruCache<Vec<u8>, Vec<u8>>>,
}

impl ObjectStore {
    /// Opens the repository at `path`, creating it when it does not exist.
    pub(crate) fn init_or_open(
        path: &Path,
        head_ref: &str,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        if !path.exists() {
            init_repo(path, head_ref)?;
        } else if !is_repository(path) {
            return Err(StoreError::NotARepository {
                path: path.to_path_buf(),
            });
        }
        let own_dir = path.join("svnbridge");
        if !own_dir.is_dir() {
            create_dir(own_dir)?;
        }

        let mut store = Self::new(path, cache_size);
        store.empty_tree_oid = store.put(gix_object::Tree::empty())?;
        Ok(store)
    }

    /// Opens a repository written by a previous conversion, without
    /// modifying it.
    pub(crate) fn open(path: &Path, cache_size: usize) -> Result<Self, StoreError> {
        if !is_repository(path) {
            return Err(StoreError::NotARepository {
                path: path.to_path_buf(),
            });
        }
        if !path.join("svnbridge").is_dir() {
            return Err(StoreError::NotConverted {
                path: path.to_path_buf(),
            });
        }
        Ok(Self::new(path, cache_size))
    }

    fn new(path: &Path, cache_size: usize) -> Self {
        let hash_kind = gix_hash::Kind::Sha1;
        Self {
            path: path.to_path_buf(),
            hash_kind,
            empty_tree_oid: ObjectId::empty_tree(hash_kind),
            unsynced: Vec::new(),
            tree_cache: RefCell::new(lru_mem::LruCache::new(cache_size)),
        }
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn empty_tree_oid(&self) -> ObjectId {
        self.empty_tree_oid
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_string();
        let mut path = self.path.join("objects");
        path.push(&hex[..2]);
        path.push(&hex[2..]);
        path
    }

    pub(crate) fn put(&mut self, object: impl gix_object::WriteTo) -> Result<ObjectId, StoreError> {
        let kind = object.kind();
        let mut raw_obj = Vec::with_capacity(object.size() as usize);
        object
            .write_to(&mut raw_obj)
            .map_err(|_| StoreError::Hash)?;
        self.put_raw(kind, raw_obj)
    }

    pub(crate) fn put_blob(&mut self, data: Vec<u8>) -> Result<ObjectId, StoreError> {
        self.put_raw(gix_object::Kind::Blob, data)
    }

    pub(crate) fn put_raw(
        &mut self,
        kind: gix_object::Kind,
        raw_obj: Vec<u8>,
    ) -> Result<ObjectId, StoreError> {
        let id = gix_object::compute_hash(self.hash_kind, kind, &raw_obj)
            .map_err(|_| StoreError::Hash)?;

        let obj_path = self.object_path(id);
        if obj_path.exists() {
            return Ok(id);
        }
        let Some(obj_dir) = obj_path.parent() else {
            return Err(StoreError::ObjectNotFound { id });
        };
        if !obj_dir.is_dir() {
            create_dir(obj_dir)?;
        }

        let header = format!("{} {}\0", kind, raw_obj.len());
        let encoded =
            zlib_encode(header.as_bytes(), &raw_obj).map_err(|e| StoreError::WriteFile {
                path: obj_path.clone(),
                error: e,
            })?;

        let tmp_path = obj_dir.join(format!("tmp_obj_{}", std::process::id()));
        create_file(&tmp_path, &encoded)?;
        rename(&tmp_path, &obj_path)?;
        self.unsynced.push(obj_path);

        if kind == gix_object::Kind::Tree {
            self.cache_tree(id, raw_obj);
        }
        Ok(id)
    }

    fn cache_tree(&self, id: ObjectId, raw_obj: Vec<u8>) {
        // objects larger than the cache are not kept
        let _ = self
            .tree_cache
            .borrow_mut()
            .insert(id.as_bytes().to_vec(), raw_obj);
    }

    /// Flushes every object written since the last call to disk.
    pub(crate) fn sync(&mut self) -> Result<(), StoreError> {
        for path in self.unsynced.drain(..) {
            std::fs::File::open(&path)
                .and_then(|f| f.sync_all())
                .map_err(|e| StoreError::WriteFile {
                    path: path.clone(),
                    error: e,
                })?;
        }
        Ok(())
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.object_path(id).exists()
    }

    pub(crate) fn get_raw(&self, id: ObjectId) -> Result<(gix_object::Kind, Vec<u8>), StoreError> {
        if let Some(raw) = self.tree_cache.borrow_mut().get(id.as_bytes()) {
            return Ok((gix_object::Kind::Tree, raw.clone()));
        }

        let obj_path = self.object_path(id);
        let file = match std::fs::File::open(&obj_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ObjectNotFound { id });
            }
            Err(e) => {
                return Err(StoreError::ReadFile {
                    path: obj_path,
                    error: e,
                });
            }
        };
        let mut data = Vec::new();
        flate2::read::ZlibDecoder::new(file)
            .read_to_end(&mut data)
            .map_err(|e| StoreError::ReadFile {
                path: obj_path,
                error: e,
            })?;

        let header_len = data
            .iter()
            .position(|&c| c == 0)
            .ok_or(StoreError::ParseObject { id })?;
        let (kind, size) = {
            let header = &data[..header_len];
            let sep = header
                .iter()
                .position(|&c| c == b' ')
                .ok_or(StoreError::ParseObject { id })?;
            let kind = gix_object::Kind::from_bytes(&header[..sep])
                .map_err(|_| StoreError::ParseObject { id })?;
            let size = std::str::from_utf8(&header[(sep + 1)..])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or(StoreError::ParseObject { id })?;
            (kind, size)
        };
        let body = data.split_off(header_len + 1);
        if body.len() != size {
            return Err(StoreError::ParseObject { id });
        }

        if kind == gix_object::Kind::Tree {
            self.cache_tree(id, body.clone());
        }
        Ok((kind, body))
    }

    fn get_kind(&self, id: ObjectId, kind: gix_object::Kind) -> Result<Vec<u8>, StoreError> {
        let (obj_kind, raw_obj) = self.get_raw(id)?;
        if obj_kind != kind {
            return Err(StoreError::UnexpectedObjectKind { id, kind: obj_kind });
        }
        Ok(raw_obj)
    }

    pub(crate) fn get_blob(&self, id: ObjectId) -> Result<Vec<u8>, StoreError> {
        self.get_kind(id, gix_object::Kind::Blob)
    }

    pub(crate) fn get_tree_entries(
        &self,
        id: ObjectId,
    ) -> Result<Vec<(Vec<u8>, EntryMode, ObjectId)>, StoreError> {
        let raw_obj = self.get_kind(id, gix_object::Kind::Tree)?;
        let tree = gix_object::TreeRef::from_bytes(&raw_obj)
            .map_err(|_| StoreError::ParseObject { id })?;
        Ok(tree
            .entries
            .iter()
            .map(|entry| (entry.filename.to_vec(), entry.mode, entry.oid.to_owned()))
            .collect())
    }

    pub(crate) fn get_commit(&self, id: ObjectId) -> Result<CommitData, StoreError> {
        let raw_obj = self.get_kind(id, gix_object::Kind::Commit)?;
        parse_commit(&raw_obj).ok_or(StoreError::ParseObject { id })
    }

    /// Follows annotated tags down to the commit they point to.
    pub(crate) fn peel_to_commit(&self, mut id: ObjectId) -> Result<ObjectId, StoreError> {
        loop {
            let (kind, raw_obj) = self.get_raw(id)?;
            match kind {
                gix_object::Kind::Commit => return Ok(id),
                gix_object::Kind::Tag => {
                    let tag = gix_object::TagRef::from_bytes(&raw_obj)
                        .map_err(|_| StoreError::ParseObject { id })?;
                    id = ObjectId::from_hex(tag.target)
                        .map_err(|_| StoreError::ParseObject { id })?;
                }
                kind => return Err(StoreError::UnexpectedObjectKind { id, kind }),
            }
        }
    }

    pub(crate) fn ls(
        &self,
        root_oid: ObjectId,
        path: &[u8],
    ) -> Result<Option<(EntryMode, ObjectId)>, StoreError> {
        if path.is_empty() {
            return Ok(Some((EntryKind::Tree.into(), root_oid)));
        }

        let mut cur_mode = EntryMode::from(EntryKind::Tree);
        let mut cur_oid = root_oid;

        for entry_name in path.split(|&c| c == b'/') {
            if !cur_mode.is_tree() {
                return Ok(None);
            }

            let entries = self.get_tree_entries(cur_oid)?;
            if let Some((_, mode, oid)) = entries.into_iter().find(|(name, ..)| name == entry_name)
            {
                cur_mode = mode;
                cur_oid = oid;
            } else {
                return Ok(None);
            }
        }

        Ok(Some((cur_mode, cur_oid)))
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        let mut path = self.path.clone();
        path.extend(name.split('/'));
        path
    }

    /// Resolves a ref, following symbolic refs such as `HEAD`.
    pub(crate) fn read_ref(&self, name: &str) -> Result<Option<ObjectId>, StoreError> {
        let path = self.ref_path(name);
        match std::fs::read(&path) {
            Ok(raw) if raw.starts_with(b"ref: ") => {
                match std::str::from_utf8(raw[5..].trim_ascii()) {
                    Ok(target) if target != name => self.read_ref(target),
                    _ => Err(StoreError::ReadFile {
                        path,
                        error: std::io::Error::from(std::io::ErrorKind::InvalidData),
                    }),
                }
            }
            Ok(raw) => ObjectId::from_hex(raw.trim_ascii())
                .map(Some)
                .map_err(|_| StoreError::ReadFile {
                    path,
                    error: std::io::Error::from(std::io::ErrorKind::InvalidData),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(self.read_packed_refs()?.remove(name))
            }
            Err(e) => Err(StoreError::ReadFile { path, error: e }),
        }
    }

    fn read_packed_refs(&self) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let path = self.path.join("packed-refs");
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StoreError::ReadFile { path, error: e }),
        };
        Ok(raw
            .lines()
            .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
            .filter_map(|line| {
                let (oid, name) = line.split_once(' ')?;
                Some((name.to_string(), ObjectId::from_hex(oid.as_bytes()).ok()?))
            })
            .collect())
    }

    /// Lists loose and packed refs whose name starts with `prefix`.
    pub(crate) fn list_refs(&self, prefix: &str) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let mut refs: BTreeMap<_, _> = self
            .read_packed_refs()?
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .collect();

        let mut pending = vec![(self.path.join("refs"), String::from("refs"))];
        while let Some((dir, name)) = pending.pop() {
            let read_dir = std::fs::read_dir(&dir).map_err(|e| StoreError::ReadFile {
                path: dir.clone(),
                error: e,
            })?;
            for entry in read_dir {
                let entry = entry.map_err(|e| StoreError::ReadFile {
                    path: dir.clone(),
                    error: e,
                })?;
                let Ok(file_name) = entry.file_name().into_string() else {
                    continue;
                };
                let full_name = format!("{name}/{file_name}");
                if entry.path().is_dir() {
                    pending.push((entry.path(), full_name));
                } else if full_name.starts_with(prefix) {
                    if let Some(oid) = self.read_ref(&full_name)? {
                        refs.insert(full_name, oid);
                    }
                }
            }
        }
        Ok(refs)
    }

    pub(crate) fn write_ref(&mut self, name: &str, oid: ObjectId) -> Result<(), StoreError> {
        let path = self.ref_path(name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::CreateDir {
                path: dir.to_path_buf(),
                error: e,
            })?;
        }
        write_replace(&path, format!("{oid}\n").as_bytes())
    }

    pub(crate) fn delete_ref(&mut self, name: &str) -> Result<(), StoreError> {
        let path = self.ref_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::RemoveFile { path, error: e }),
        }
    }

    pub(crate) fn set_head(&mut self, head_ref: &str) -> Result<(), StoreError> {
        write_replace(
            &self.path.join("HEAD"),
            format!("ref: {head_ref}\n").as_bytes(),
        )
    }
}

fn is_repository(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("refs").is_dir()
}

fn init_repo(path: &Path, head_ref: &str) -> Result<(), StoreError> {
    create_dir(path)?;

    let objects_path = path.join("objects");
    create_dir(&objects_path)?;
    create_dir(objects_path.join("info"))?;
    create_dir(objects_path.join("pack"))?;

    let refs_path = path.join("refs");
    create_dir(&refs_path)?;
    create_dir(refs_path.join("heads"))?;
    create_dir(refs_path.join("tags"))?;

    create_dir(path.join("branches"))?;
    create_dir(path.join("hooks"))?;

    let info_path = path.join("info");
    create_dir(&info_path)?;
    create_file(info_path.join("exclude"), b"")?;

    let config = b"[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";
    create_file(path.join("config"), config)?;
    create_file(path.join("HEAD"), format!("ref: {head_ref}\n").as_bytes())?;

    Ok(())
}

fn zlib_encode(header: &[u8], body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(body.len() / 2 + 32),
        flate2::Compression::default(),
    );
    encoder.write_all(header)?;
    encoder.write_all(body)?;
    encoder.finish()
}

fn create_dir<P>(path: P) -> Result<(), StoreError>
where
    P: AsRef<Path> + Into<PathBuf>,
{
    std::fs::create_dir(path.as_ref()).map_err(|e| StoreError::CreateDir {
        path: path.into(),
        error: e,
    })
}

fn create_file<P>(path: P, data: &[u8]) -> Result<(), StoreError>
where
    P: AsRef<Path> + Into<PathBuf>,
{
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path.as_ref())
        .and_then(|mut file| {
            file.write_all(data)?;
            file.flush()?;
            Ok(())
        })
        .map_err(|e| StoreError::CreateFile {
            path: path.into(),
            error: e,
        })
}

fn rename<P, Q>(from: P, to: Q) -> Result<(), StoreError>
where
    P: AsRef<Path> + Into<PathBuf>,
    Q: AsRef<Path> + Into<PathBuf>,
{
    std::fs::rename(from.as_ref(), to.as_ref()).map_err(|e| StoreError::Rename {
        source_path: from.into(),
        dest_path: to.into(),
        error: e,
    })
}

/// Replaces the content of `path` through a temporary file.
pub(crate) fn write_replace(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    create_file(&tmp_path, data)?;
    std::fs::File::open(&tmp_path)
        .and_then(|f| f.sync_all())
        .map_err(|e| StoreError::WriteFile {
            path: tmp_path.clone(),
            error: e,
        })?;
    rename(&tmp_path, path)
}
