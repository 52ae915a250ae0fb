// svndiff format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/svndiff
// Only version 0 (uncompressed windows) appears in dump files.

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeltaError {
    BadHeader,
    BadVarInt,
    Truncated,
    SourceOutOfBounds { offset: u64, len: u64 },
    TargetOutOfBounds { offset: u64, len: u64 },
    NewDataExhausted,
    BadInstruction(u8),
    WindowLenMismatch { expected: u64, actual: usize },
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BadHeader => write!(f, "not an svndiff0 delta"),
            Self::BadVarInt => write!(f, "malformed variable-length integer"),
            Self::Truncated => write!(f, "truncated delta window"),
            Self::SourceOutOfBounds { offset, len } => {
                write!(f, "source copy {offset}+{len} is out of bounds")
            }
            Self::TargetOutOfBounds { offset, len } => {
                write!(f, "target copy {offset}+{len} is out of bounds")
            }
            Self::NewDataExhausted => write!(f, "new data exhausted"),
            Self::BadInstruction(op) => write!(f, "invalid instruction selector {op}"),
            Self::WindowLenMismatch { expected, actual } => {
                write!(f, "window produced {actual} bytes, expected {expected}")
            }
        }
    }
}

struct Cursor<'a> {
    rem: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn int(&mut self) -> Result<u64, DeltaError> {
        let mut value = 0u64;
        loop {
            let (&byte, rest) = self.rem.split_first().ok_or(DeltaError::BadVarInt)?;
            self.rem = rest;
            if value > (u64::MAX >> 7) {
                return Err(DeltaError::BadVarInt);
            }
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8], DeltaError> {
        let len = usize::try_from(len).map_err(|_| DeltaError::Truncated)?;
        if self.rem.len() < len {
            return Err(DeltaError::Truncated);
        }
        let (head, rest) = self.rem.split_at(len);
        self.rem = rest;
        Ok(head)
    }
}

fn range(offset: u64, len: u64, bound: usize) -> Option<std::ops::Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= bound).then_some(start..end)
}

/// Reconstructs a full text from its base and an svndiff0 delta.
pub(crate) fn apply(delta: &[u8], base: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut cur = Cursor {
        rem: delta.strip_prefix(b"SVN\0").ok_or(DeltaError::BadHeader)?,
    };

    let mut out = Vec::new();
    while !cur.rem.is_empty() {
        let src_off = cur.int()?;
        let src_len = cur.int()?;
        let tgt_len = cur.int()?;
        let ins_len = cur.int()?;
        let new_len = cur.int()?;

        let src_view = range(src_off, src_len, base.len())
            .map(|r| &base[r])
            .ok_or(DeltaError::SourceOutOfBounds {
                offset: src_off,
                len: src_len,
            })?;
        let mut ins = Cursor {
            rem: cur.take(ins_len)?,
        };
        let mut new_data = Cursor {
            rem: cur.take(new_len)?,
        };

        let window_start = out.len();
        while let Some((&first, rest)) = ins.rem.split_first() {
            ins.rem = rest;
            let len = match first & 0x3F {
                0 => ins.int()?,
                n => u64::from(n),
            };
            match first >> 6 {
                0b00 => {
                    let offset = ins.int()?;
                    let r = range(offset, len, src_view.len())
                        .ok_or(DeltaError::SourceOutOfBounds { offset, len })?;
                    out.extend_from_slice(&src_view[r]);
                }
                0b01 => {
                    // may overlap the bytes being produced
                    let offset = ins.int()?;
                    let window_len = out.len() - window_start;
                    let start = usize::try_from(offset)
                        .ok()
                        .filter(|&o| o < window_len || len == 0)
                        .ok_or(DeltaError::TargetOutOfBounds { offset, len })?;
                    let len = usize::try_from(len)
                        .map_err(|_| DeltaError::TargetOutOfBounds { offset, len })?;
                    for i in 0..len {
                        let byte = out[window_start + start + i];
                        out.push(byte);
                    }
                }
                0b10 => {
                    let data = new_data.take(len).map_err(|_| DeltaError::NewDataExhausted)?;
                    out.extend_from_slice(data);
                }
                op => return Err(DeltaError::BadInstruction(op)),
            }
        }

        let produced = out.len() - window_start;
        if u64::try_from(produced).ok() != Some(tgt_len) {
            return Err(DeltaError::WindowLenMismatch {
                expected: tgt_len,
                actual: produced,
            });
        }
    }

    Ok(out)
}
