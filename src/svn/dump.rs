use std::collections::HashMap;
use std::io::{Read as _, Write as _};

use super::props::{self, PropChange, Properties};

// SVN dump file format described in
// https://svn.apache.org/repos/asf/subversion/trunk/notes/dump-load-format.txt

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DumpVersion {
    Two,
    Three,
}

impl DumpVersion {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"2" => Some(Self::Two),
            b"3" => Some(Self::Three),
            _ => None,
        }
    }
}

pub(crate) enum Record {
    Uuid(uuid::Uuid),
    Rev(RevRecord),
    Node(NodeRecord),
}

pub(crate) struct RevRecord {
    pub(crate) rev_no: u32,
    pub(crate) properties: Properties,
}

pub(crate) struct NodeRecord {
    pub(crate) path: Vec<u8>,
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: NodeAction,
    pub(crate) copy_from: Option<(u32, Vec<u8>)>,
    pub(crate) properties: Option<PropChange>,
    pub(crate) text: Option<NodeText>,
}

pub(crate) struct NodeText {
    pub(crate) is_delta: bool,
    pub(crate) data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeAction {
    Change,
    Add,
    Delete,
    Replace,
}

impl NodeAction {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"change" => Some(Self::Change),
            b"add" => Some(Self::Add),
            b"delete" => Some(Self::Delete),
            b"replace" => Some(Self::Replace),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Change => "change",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    fn parse(s: &[u8]) -> Option<Self> {
        match s {
            b"file" => Some(Self::File),
            b"dir" => Some(Self::Dir),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

fn parse_bool(s: &[u8]) -> Option<bool> {
    match s {
        b"true" => Some(true),
        b"false" => Some(false),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) enum ReadError {
    Io(std::io::Error),
    BrokenHeader,
    InvalidVersion { version: Vec<u8> },
    MissingHeaderEntry { key: Vec<u8> },
    UnexpectedHeaderEntry { key: Vec<u8> },
    InvalidHeaderEntry { key: Vec<u8>, value: Vec<u8> },
    UnknownRecordType,
    MismatchedContentLen,
    BrokenProperties,
}

impl From<std::io::Error> for ReadError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => write!(f, "failed to read source: {e}"),
            Self::BrokenHeader => write!(f, "broken header"),
            Self::InvalidVersion { ref version } => {
                write!(f, "invalid version: \"{}\"", version.escape_ascii())
            }
            Self::MissingHeaderEntry { ref key } => {
                write!(f, "missing header entry: \"{}\"", key.escape_ascii())
            }
            Self::UnexpectedHeaderEntry { ref key } => {
                write!(f, "unexpected header entry: \"{}\"", key.escape_ascii())
            }
            Self::InvalidHeaderEntry { ref key, ref value } => write!(
                f,
                "invalid value header entry \"{}\": \"{}\"",
                key.escape_ascii(),
                value.escape_ascii(),
            ),
            Self::UnknownRecordType => write!(f, "unknown record type"),
            Self::MismatchedContentLen => write!(f, "mismatched content length"),
            Self::BrokenProperties => write!(f, "broken properties"),
        }
    }
}

pub(crate) struct DumpReader<R> {
    source: R,
    version: DumpVersion,
}

impl<R: std::io::BufRead> DumpReader<R> {
    pub(crate) fn new(mut source: R) -> Result<Self, ReadError> {
        let header = parse_header(&mut source)?
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

        let version_key = b"SVN-fs-dump-format-version";
        let raw_version =
            header
                .get(version_key.as_slice())
                .ok_or_else(|| ReadError::MissingHeaderEntry {
                    key: version_key.to_vec(),
                })?;
        let version = DumpVersion::parse(raw_version).ok_or_else(|| ReadError::InvalidVersion {
            version: raw_version.clone(),
        })?;

        Ok(Self { source, version })
    }

    pub(crate) fn into_inner(self) -> R {
        self.source
    }

    fn has_deltas(&self) -> bool {
        match self.version {
            DumpVersion::Two => false,
            DumpVersion::Three => true,
        }
    }

    pub(crate) fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        let Some(header) = parse_header(&mut self.source)? else {
            return Ok(None);
        };

        let raw_uuid = header.get(b"UUID".as_slice());
        let raw_rev_no = header.get(b"Revision-number".as_slice());
        let raw_node_path = header.get(b"Node-path".as_slice());

        let type_cnt = usize::from(raw_uuid.is_some())
            + usize::from(raw_rev_no.is_some())
            + usize::from(raw_node_path.is_some());
        if type_cnt != 1 {
            return Err(ReadError::UnknownRecordType);
        }

        let content_len = header_num::<u64>(&header, b"Content-length")?;
        let prop_content_len = header_num::<u64>(&header, b"Prop-content-length")?;

        if let Some(raw_uuid) = raw_uuid {
            if content_len.unwrap_or(0) != 0 {
                return Err(ReadError::MismatchedContentLen);
            }

            uuid::Uuid::try_parse_ascii(raw_uuid)
                .map(|uuid| Some(Record::Uuid(uuid)))
                .map_err(|_| ReadError::InvalidHeaderEntry {
                    key: b"UUID".to_vec(),
                    value: raw_uuid.clone(),
                })
        } else if raw_rev_no.is_some() {
            let rev_no = header_num::<u32>(&header, b"Revision-number")?
                .ok_or(ReadError::UnknownRecordType)?;

            if prop_content_len.unwrap_or(0) != content_len.unwrap_or(0) {
                return Err(ReadError::MismatchedContentLen);
            }

            let properties = match prop_content_len {
                Some(len) => self
                    .read_properties(len, false)?
                    .into_iter()
                    .filter_map(|(k, v)| v.map(|v| (k, v)))
                    .collect(),
                None => Properties::new(),
            };

            Ok(Some(Record::Rev(RevRecord { rev_no, properties })))
        } else if let Some(raw_node_path) = raw_node_path {
            let kind = header
                .get(b"Node-kind".as_slice())
                .map(|raw| {
                    NodeKind::parse(raw).ok_or_else(|| ReadError::InvalidHeaderEntry {
                        key: b"Node-kind".to_vec(),
                        value: raw.clone(),
                    })
                })
                .transpose()?;

            let raw_action =
                header
                    .get(b"Node-action".as_slice())
                    .ok_or_else(|| ReadError::MissingHeaderEntry {
                        key: b"Node-action".to_vec(),
                    })?;
            let action =
                NodeAction::parse(raw_action).ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: b"Node-action".to_vec(),
                    value: raw_action.clone(),
                })?;

            let copy_from_rev = header_num::<u32>(&header, b"Node-copyfrom-rev")?;
            let copy_from_path = header.get(b"Node-copyfrom-path".as_slice());
            let copy_from = match (copy_from_rev, copy_from_path) {
                (None, None) => None,
                (Some(rev), Some(path)) => Some((rev, path.clone())),
                (Some(_), None) => {
                    return Err(ReadError::MissingHeaderEntry {
                        key: b"Node-copyfrom-path".to_vec(),
                    });
                }
                (None, Some(_)) => {
                    return Err(ReadError::MissingHeaderEntry {
                        key: b"Node-copyfrom-rev".to_vec(),
                    });
                }
            };

            let text_content_len = header_num::<u64>(&header, b"Text-content-length")?;

            let expected_content_len = prop_content_len
                .unwrap_or(0)
                .checked_add(text_content_len.unwrap_or(0))
                .ok_or(ReadError::MismatchedContentLen)?;
            if content_len.unwrap_or(0) != expected_content_len {
                return Err(ReadError::MismatchedContentLen);
            }

            let properties = prop_content_len
                .map(|len| {
                    let is_delta = self.delta_flag(&header, b"Prop-delta")?;
                    let properties = self.read_properties(len, is_delta)?;
                    Ok::<_, ReadError>(PropChange {
                        is_delta,
                        properties,
                    })
                })
                .transpose()?;

            let text = text_content_len
                .map(|len| {
                    let is_delta = self.delta_flag(&header, b"Text-delta")?;
                    let len = usize::try_from(len).map_err(|_| ReadError::MismatchedContentLen)?;
                    let mut data = vec![0; len];
                    self.source.read_exact(&mut data)?;
                    Ok::<_, ReadError>(NodeText { is_delta, data })
                })
                .transpose()?;

            Ok(Some(Record::Node(NodeRecord {
                path: raw_node_path.clone(),
                kind,
                action,
                copy_from,
                properties,
                text,
            })))
        } else {
            Err(ReadError::UnknownRecordType)
        }
    }

    fn delta_flag(&self, header: &RecordHeader, key: &[u8]) -> Result<bool, ReadError> {
        let Some(raw) = header.get(key) else {
            return Ok(false);
        };
        let flag = parse_bool(raw).ok_or_else(|| ReadError::InvalidHeaderEntry {
            key: key.to_vec(),
            value: raw.clone(),
        })?;
        if !self.has_deltas() {
            return Err(ReadError::UnexpectedHeaderEntry { key: key.to_vec() });
        }
        Ok(flag)
    }

    fn read_properties(
        &mut self,
        len: u64,
        is_delta: bool,
    ) -> Result<std::collections::BTreeMap<Vec<u8>, Option<Vec<u8>>>, ReadError> {
        let mut prop_stream = (&mut self.source).take(len);
        match props::parse(&mut prop_stream, is_delta) {
            Ok(_) if prop_stream.limit() != 0 => Err(ReadError::BrokenProperties),
            Ok(props) => Ok(props),
            Err(e) => match e.kind() {
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                    Err(ReadError::BrokenProperties)
                }
                _ => Err(ReadError::Io(e)),
            },
        }
    }
}

type RecordHeader = HashMap<Vec<u8>, Vec<u8>>;

fn header_num<T: std::str::FromStr>(
    header: &RecordHeader,
    key: &[u8],
) -> Result<Option<T>, ReadError> {
    header
        .get(key)
        .map(|raw| {
            std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<T>().ok())
                .ok_or_else(|| ReadError::InvalidHeaderEntry {
                    key: key.to_vec(),
                    value: raw.clone(),
                })
        })
        .transpose()
}

fn parse_header(r: &mut dyn std::io::BufRead) -> Result<Option<RecordHeader>, ReadError> {
    let mut buf = Vec::new();
    r.read_until(b'\n', &mut buf)?;
    while buf == b"\n" {
        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }
    if buf.is_empty() {
        return Ok(None);
    }
    let mut map = HashMap::new();
    while buf != b"\n" {
        let line = buf.strip_suffix(b"\n").ok_or(ReadError::BrokenHeader)?;

        let sep_pos = line
            .windows(2)
            .position(|n| n == b": ")
            .ok_or(ReadError::BrokenHeader)?;
        map.insert(line[..sep_pos].to_vec(), line[(sep_pos + 2)..].to_vec());

        buf.clear();
        r.read_until(b'\n', &mut buf)?;
    }

    Ok(Some(map))
}

/// Node record to be written by [`DumpWriter`].
pub(crate) struct NodeOut<'a> {
    pub(crate) path: &'a [u8],
    pub(crate) kind: Option<NodeKind>,
    pub(crate) action: NodeAction,
    pub(crate) copy_from: Option<(u32, &'a [u8])>,
    pub(crate) properties: Option<&'a Properties>,
    pub(crate) text: Option<&'a [u8]>,
}

/// Writes version 2 dump streams (full texts, full property lists).
pub(crate) struct DumpWriter<W> {
    out: W,
}

impl<W: std::io::Write> DumpWriter<W> {
    pub(crate) fn new(out: W) -> Self {
        Self { out }
    }

    pub(crate) fn into_inner(self) -> W {
        self.out
    }

    pub(crate) fn write_header(&mut self, uuid: Option<&uuid::Uuid>) -> std::io::Result<()> {
        self.out.write_all(b"SVN-fs-dump-format-version: 2\n\n")?;
        if let Some(uuid) = uuid {
            write!(self.out, "UUID: {uuid}\n\n")?;
        }
        Ok(())
    }

    pub(crate) fn write_revision(&mut self, rev_no: u32, props: &Properties) -> std::io::Result<()> {
        let raw_props = props::serialize(props);
        writeln!(self.out, "Revision-number: {rev_no}")?;
        writeln!(self.out, "Prop-content-length: {}", raw_props.len())?;
        writeln!(self.out, "Content-length: {}", raw_props.len())?;
        self.out.write_all(b"\n")?;
        self.out.write_all(&raw_props)?;
        self.out.write_all(b"\n")
    }

    pub(crate) fn write_node(&mut self, node: &NodeOut<'_>) -> std::io::Result<()> {
        self.out.write_all(b"Node-path: ")?;
        self.out.write_all(node.path)?;
        self.out.write_all(b"\n")?;
        if let Some(kind) = node.kind {
            writeln!(self.out, "Node-kind: {}", kind.as_str())?;
        }
        writeln!(self.out, "Node-action: {}", node.action.as_str())?;
        if let Some((rev, path)) = node.copy_from {
            writeln!(self.out, "Node-copyfrom-rev: {rev}")?;
            self.out.write_all(b"Node-copyfrom-path: ")?;
            self.out.write_all(path)?;
            self.out.write_all(b"\n")?;
        }

        let raw_props = node.properties.map(props::serialize);
        let props_len = raw_props.as_ref().map(Vec::len);
        let text_len = node.text.map(<[u8]>::len);
        if let Some(props_len) = props_len {
            writeln!(self.out, "Prop-content-length: {props_len}")?;
        }
        if let Some(text_len) = text_len {
            writeln!(self.out, "Text-content-length: {text_len}")?;
        }
        if props_len.is_some() || text_len.is_some() {
            writeln!(
                self.out,
                "Content-length: {}",
                props_len.unwrap_or(0) + text_len.unwrap_or(0),
            )?;
        }
        self.out.write_all(b"\n")?;

        if let Some(raw_props) = raw_props {
            self.out.write_all(&raw_props)?;
        }
        if let Some(text) = node.text {
            self.out.write_all(text)?;
        }
        self.out.write_all(b"\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::{DumpReader, DumpWriter, NodeAction, NodeKind, NodeOut, Record};
    use crate::svn::props::Properties;

    #[test]
    fn test_read_written() {
        let uuid = uuid::Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef);
        let mut rev_props = Properties::new();
        rev_props.insert(b"svn:log".to_vec(), b"msg".to_vec());

        let mut writer = DumpWriter::new(Vec::new());
        writer.write_header(Some(&uuid)).unwrap();
        writer.write_revision(1, &rev_props).unwrap();
        writer
            .write_node(&NodeOut {
                path: b"trunk",
                kind: Some(NodeKind::Dir),
                action: NodeAction::Add,
                copy_from: None,
                properties: None,
                text: None,
            })
            .unwrap();
        writer
            .write_node(&NodeOut {
                path: b"branches/b",
                kind: Some(NodeKind::Dir),
                action: NodeAction::Add,
                copy_from: Some((1, b"trunk")),
                properties: None,
                text: None,
            })
            .unwrap();
        writer
            .write_node(&NodeOut {
                path: b"trunk/a",
                kind: Some(NodeKind::File),
                action: NodeAction::Add,
                copy_from: None,
                properties: Some(&Properties::new()),
                text: Some(b"data\n"),
            })
            .unwrap();
        let raw = writer.into_inner();

        let mut reader = DumpReader::new(raw.as_slice()).unwrap();
        let Some(Record::Uuid(read_uuid)) = reader.next_record().unwrap() else {
            panic!("expected UUID record");
        };
        assert_eq!(read_uuid, uuid);

        let Some(Record::Rev(rev)) = reader.next_record().unwrap() else {
            panic!("expected revision record");
        };
        assert_eq!(rev.rev_no, 1);
        assert_eq!(rev.properties, rev_props);

        let Some(Record::Node(node)) = reader.next_record().unwrap() else {
            panic!("expected node record");
        };
        assert_eq!(node.path, b"trunk");
        assert_eq!(node.action, NodeAction::Add);
        assert!(node.properties.is_none() && node.text.is_none());

        let Some(Record::Node(node)) = reader.next_record().unwrap() else {
            panic!("expected node record");
        };
        assert_eq!(node.copy_from, Some((1, b"trunk".to_vec())));

        let Some(Record::Node(node)) = reader.next_record().unwrap() else {
            panic!("expected node record");
        };
        assert_eq!(node.kind, Some(NodeKind::File));
        assert_eq!(node.text.unwrap().data, b"data\n");
        assert!(node.properties.unwrap().properties.is_empty());

        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_delta_flags_need_v3() {
        let raw = b"SVN-fs-dump-format-version: 2\n\n\
            Revision-number: 1\n\n\
            Node-path: a\nNode-kind: file\nNode-action: change\n\
            Text-delta: true\nText-content-length: 0\nContent-length: 0\n\n";
        let mut reader = DumpReader::new(raw.as_slice()).unwrap();
        assert!(matches!(reader.next_record(), Ok(Some(Record::Rev(_)))));
        assert!(reader.next_record().is_err());
    }
}
