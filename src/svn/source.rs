use std::ffi::OsString;
use std::io::{Read as _, Seek as _};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub(crate) enum OpenError {
    Metadata {
        path: PathBuf,
        error: std::io::Error,
    },
    Open {
        path: PathBuf,
        error: std::io::Error,
    },
    Read {
        path: PathBuf,
        error: std::io::Error,
    },
    Spawn {
        arg0: OsString,
        error: std::io::Error,
    },
    Command {
        arg0: OsString,
        status: std::process::ExitStatus,
    },
    Output {
        arg0: OsString,
        output: Vec<u8>,
    },
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Metadata { path, error } => {
                write!(f, "failed to fetch metadata for {path:?}: {error}")
            }
            Self::Open { path, error } => write!(f, "failed to open file {path:?}: {error}"),
            Self::Read { path, error } => write!(f, "failed to read file {path:?}: {error}"),
            Self::Spawn { arg0, error } => {
                write!(f, "failed to spawn process {arg0:?}: {error}")
            }
            Self::Command { arg0, status } => write!(f, "process {arg0:?} finished with {status}"),
            Self::Output { arg0, output } => write!(
                f,
                "unexpected output from {arg0:?}: \"{}\"",
                output.escape_ascii(),
            ),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Compression {
    None,
    Zstd,
    Gzip,
    Bzip2,
    Xz,
    Lz4,
}

impl Compression {
    pub(crate) fn sniff(header: &[u8]) -> Self {
        const MAGICS: &[(&[u8], Compression)] = &[
            (&[0x28, 0xB5, 0x2F, 0xFD], Compression::Zstd),
            (&[0x1F, 0x8B], Compression::Gzip),
            (b"BZh", Compression::Bzip2),
            (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], Compression::Xz),
            (&[0x04, 0x22, 0x4D, 0x18], Compression::Lz4),
        ];
        MAGICS
            .iter()
            .find(|(magic, _)| header.starts_with(magic))
            .map_or(Self::None, |&(_, c)| c)
    }

    fn decoder(
        self,
        file: std::fs::File,
    ) -> Result<Box<dyn std::io::Read + Send>, std::io::Error> {
        Ok(match self {
            Self::None => Box::new(file),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
            Self::Gzip => Box::new(flate2::read::MultiGzDecoder::new(file)),
            Self::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(file)),
            Self::Xz => Box::new(liblzma::read::XzDecoder::new_multi_decoder(file)),
            Self::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
        })
    }
}

/// Reads the first bytes of a file to detect its compression.
pub(crate) fn sniff_file(path: &Path) -> Result<(std::fs::File, Compression), OpenError> {
    const HEADER_SIZE: usize = 6;

    let mut file = std::fs::File::open(path).map_err(|e| OpenError::Open {
        path: path.to_path_buf(),
        error: e,
    })?;

    let mut header = Vec::with_capacity(HEADER_SIZE);
    (&mut file)
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut header)
        .and_then(|_| file.seek(std::io::SeekFrom::Start(0)))
        .map_err(|e| OpenError::Read {
            path: path.to_path_buf(),
            error: e,
        })?;

    Ok((file, Compression::sniff(&header)))
}

/// Byte stream of a dump, either decoded from a file or produced by
/// `svnadmin dump`.
pub(crate) enum DumpSource {
    File(std::io::BufReader<Box<dyn std::io::Read + Send>>),
    Command(
        std::process::Child,
        std::io::BufReader<std::process::ChildStdout>,
    ),
}

impl DumpSource {
    pub(crate) fn open(path: &Path, since: u32) -> Result<Self, OpenError> {
        let path_meta = std::fs::metadata(path).map_err(|e| OpenError::Metadata {
            path: path.to_path_buf(),
            error: e,
        })?;
        if path_meta.file_type().is_dir() {
            if since != 0 {
                let youngest = svnlook("youngest", path)?;
                let youngest = std::str::from_utf8(&youngest)
                    .ok()
                    .and_then(|s| s.parse::<u32>().ok())
                    .ok_or_else(|| OpenError::Output {
                        arg0: "svnlook".into(),
                        output: youngest.clone(),
                    })?;
                if since > youngest {
                    tracing::debug!("repository head is r{youngest}, nothing to dump");
                    let uuid = svnlook("uuid", path)?;
                    return Ok(Self::empty(&uuid));
                }
            }
            let mut cmd = std::process::Command::new("svnadmin");
            cmd.arg("dump").arg(path).arg("-q");
            if since != 0 {
                cmd.arg("--incremental").arg("-r").arg(format!("{since}:HEAD"));
            }
            let mut child = cmd
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::inherit())
                .spawn()
                .map_err(|e| OpenError::Spawn {
                    arg0: "svnadmin".into(),
                    error: e,
                })?;
            let Some(stdout) = child.stdout.take() else {
                return Err(OpenError::Spawn {
                    arg0: "svnadmin".into(),
                    error: std::io::Error::other("no stdout pipe"),
                });
            };
            Ok(Self::Command(child, std::io::BufReader::new(stdout)))
        } else {
            let (file, compression) = sniff_file(path)?;
            if compression != Compression::None {
                tracing::debug!("dump file is compressed with {compression:?}");
            }
            let decoder = compression.decoder(file).map_err(|e| OpenError::Read {
                path: path.to_path_buf(),
                error: e,
            })?;
            Ok(Self::File(std::io::BufReader::with_capacity(
                1 << 16,
                decoder,
            )))
        }
    }

    /// A dump without revisions.
    fn empty(uuid: &[u8]) -> Self {
        let mut header = b"SVN-fs-dump-format-version: 2\n\n".to_vec();
        if !uuid.is_empty() {
            header.extend_from_slice(b"UUID: ");
            header.extend_from_slice(uuid);
            header.extend_from_slice(b"\n\n");
        }
        let reader: Box<dyn std::io::Read + Send> = Box::new(std::io::Cursor::new(header));
        Self::File(std::io::BufReader::new(reader))
    }

    pub(crate) fn close(self) -> Result<(), std::io::Error> {
        match self {
            Self::File(_) => Ok(()),
            Self::Command(mut child, stdout) => {
                drop(stdout);
                let exit_code = child.wait()?;
                if exit_code.success() {
                    Ok(())
                } else {
                    Err(std::io::Error::other(format!(
                        "process finished with {exit_code}"
                    )))
                }
            }
        }
    }
}

/// Runs `svnlook <subcommand> <repo>`, returning its trimmed output.
fn svnlook(subcommand: &str, repo: &Path) -> Result<Vec<u8>, OpenError> {
    let output = std::process::Command::new("svnlook")
        .arg(subcommand)
        .arg(repo)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::inherit())
        .output()
        .map_err(|e| OpenError::Spawn {
            arg0: "svnlook".into(),
            error: e,
        })?;
    if !output.status.success() {
        return Err(OpenError::Command {
            arg0: "svnlook".into(),
            status: output.status,
        });
    }
    Ok(output.stdout.trim_ascii().to_vec())
}

impl std::io::Read for DumpSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::File(r) => r.read(buf),
            Self::Command(_, r) => r.read(buf),
        }
    }
}

impl std::io::BufRead for DumpSource {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            Self::File(r) => r.fill_buf(),
            Self::Command(_, r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            Self::File(r) => r.consume(amt),
            Self::Command(_, r) => r.consume(amt),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::{Compression, DumpSource};

    #[test]
    fn test_sniff() {
        assert_eq!(Compression::sniff(b"SVN-fs"), Compression::None);
        assert_eq!(Compression::sniff(&[0x1F, 0x8B, 8]), Compression::Gzip);
        assert_eq!(Compression::sniff(b"BZh91A"), Compression::Bzip2);
        assert_eq!(
            Compression::sniff(&[0x28, 0xB5, 0x2F, 0xFD, 0, 0]),
            Compression::Zstd,
        );
        assert_eq!(Compression::sniff(&[0xFD, b'7']), Compression::None);
    }

    #[test]
    fn test_empty() {
        let mut out = Vec::new();
        DumpSource::empty(b"6a1c57e2-9f0b-4d3a-8c21-0e5f7b9d1234")
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(
            out,
            b"SVN-fs-dump-format-version: 2\n\nUUID: 6a1c57e2-9f0b-4d3a-8c21-0e5f7b9d1234\n\n",
        );
        DumpSource::empty(b"").close().unwrap();
    }
}
