use std::io::{Read as _, Seek as _, Write as _};
use std::path::Path;

use fs2::FileExt as _;

/// Exclusive lock held while a run writes to a repository.
///
/// The lock is an OS advisory lock on `<dir>/lock`, so it goes away with
/// the process that holds it. The file stays on disk and records the pid
/// of the last holder.
pub(crate) struct RepoLock {
    file: std::fs::File,
}

impl RepoLock {
    pub(crate) fn acquire(dir: &Path) -> Result<Self, std::io::Error> {
        let path = dir.join("lock");
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(e);
            }
            let mut owner = String::new();
            file.read_to_string(&mut owner)?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("{path:?} is locked by process {}", owner.trim()),
            ));
        }

        let mut previous = String::new();
        file.read_to_string(&mut previous)?;
        if !previous.trim().is_empty() {
            tracing::debug!("taking over lock left by process {}", previous.trim());
        }
        file.set_len(0)?;
        file.seek(std::io::SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("failed to release repository lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RepoLock;

    struct TempDir(std::path::PathBuf);

    impl TempDir {
        fn new() -> Self {
            let suffix: u64 = rand::random();
            let dir = std::env::temp_dir().join(format!("svnbridge-lock-{suffix:016x}"));
            std::fs::create_dir(&dir).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn test_exclusive() {
        let dir = TempDir::new();

        let lock = RepoLock::acquire(&dir.0).unwrap();
        let e = RepoLock::acquire(&dir.0).err().unwrap();
        assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock);
        assert!(e.to_string().contains(&std::process::id().to_string()));
        drop(lock);
        drop(RepoLock::acquire(&dir.0).unwrap());
    }

    #[test]
    fn test_left_by_dead_process() {
        let dir = TempDir::new();
        std::fs::write(dir.0.join("lock"), "999999\n").unwrap();

        let lock = RepoLock::acquire(&dir.0).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.0.join("lock")).unwrap(),
            format!("{}\n", std::process::id()),
        );
        drop(lock);
    }
}
