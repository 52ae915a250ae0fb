use std::collections::BTreeMap;
use std::io::Read as _;

// Property lists use the "hash dump" encoding from the dump file format:
// "K <len>\n<key>\nV <len>\n<value>\n" entries, "D <len>\n<key>\n" deletions
// (deltas only) and a final "PROPS-END\n".

pub(crate) type Properties = BTreeMap<Vec<u8>, Vec<u8>>;

/// A property list read from the source, possibly relative to the previous
/// property set of the same node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PropChange {
    pub(crate) is_delta: bool,
    pub(crate) properties: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl PropChange {
    pub(crate) fn full(props: &Properties) -> Self {
        Self {
            is_delta: false,
            properties: props
                .iter()
                .map(|(k, v)| (k.clone(), Some(v.clone())))
                .collect(),
        }
    }

    pub(crate) fn apply(&self, base: &mut Properties) {
        if !self.is_delta {
            base.clear();
        }
        for (key, value) in self.properties.iter() {
            if let Some(value) = value {
                base.insert(key.clone(), value.clone());
            } else {
                base.remove(key);
            }
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.properties.get(key).map(|v| v.as_deref())
    }
}

pub(crate) fn serialize(props: &Properties) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in props.iter() {
        push_entry(&mut out, key, Some(value));
    }
    out.extend(b"PROPS-END\n");
    out
}

pub(crate) fn push_entry(out: &mut Vec<u8>, key: &[u8], value: Option<&[u8]>) {
    if let Some(value) = value {
        out.extend(format!("K {}\n", key.len()).as_bytes());
        out.extend(key);
        out.extend(format!("\nV {}\n", value.len()).as_bytes());
        out.extend(value);
    } else {
        out.extend(format!("D {}\n", key.len()).as_bytes());
        out.extend(key);
    }
    out.push(b'\n');
}

pub(crate) fn deserialize(mut raw: &[u8]) -> Option<Properties> {
    let props = parse(&mut raw, false).ok()?;
    if !raw.is_empty() {
        return None;
    }
    Some(
        props
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect(),
    )
}

pub(crate) fn parse(
    r: &mut dyn std::io::BufRead,
    allow_deletions: bool,
) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>, std::io::Error> {
    let mut props = BTreeMap::new();
    loop {
        let line = read_line(r)?;
        if line == b"PROPS-END" {
            break;
        }

        if let Some(key_len) = line.strip_prefix(b"K ") {
            let key = read_counted(r, key_len)?;

            let line = read_line(r)?;
            let value_len = line.strip_prefix(b"V ").ok_or_else(invalid_data)?;
            let value = read_counted(r, value_len)?;

            props.insert(key, Some(value));
        } else if let Some(key_len) = line.strip_prefix(b"D ") {
            if !allow_deletions {
                return Err(invalid_data());
            }
            let key = read_counted(r, key_len)?;
            props.insert(key, None);
        } else {
            return Err(invalid_data());
        }
    }

    Ok(props)
}

fn read_line(r: &mut dyn std::io::BufRead) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    r.read_until(b'\n', &mut buf)?;
    if buf.pop() != Some(b'\n') {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
    }
    Ok(buf)
}

fn read_counted(r: &mut dyn std::io::BufRead, raw_len: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let len = std::str::from_utf8(raw_len)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid_data)?;

    let mut data = vec![0; len];
    r.read_exact(&mut data)?;

    let mut nl = [0];
    r.read_exact(&mut nl)?;
    if nl != *b"\n" {
        return Err(invalid_data());
    }

    Ok(data)
}

fn invalid_data() -> std::io::Error {
    std::io::Error::from(std::io::ErrorKind::InvalidData)
}
