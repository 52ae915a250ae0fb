use crate::FHashMap;

/// Git identity an svn author maps to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Identity {
    pub(crate) name: String,
    pub(crate) email: String,
}

/// Author map, `svnuser[@FROM[:TO]] = Name <email>` per line.
///
/// Ranges of one author never overlap, so at most one identity applies to
/// a given revision.
pub(crate) struct UserMap {
    authors: FHashMap<Vec<u8>, Vec<Mapping>>,
}

struct Mapping {
    first: u32,
    last: u32,
    identity: Identity,
}

#[derive(Debug)]
pub(crate) enum UserMapParseError {
    Io(std::io::Error),
    Line { line: usize, error: LineError },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineError {
    NoSeparator,
    NoAuthor,
    BadRevisions,
    BadIdentity,
    NoEmail,
    Overlaps { first: u32, last: u32 },
}

impl From<std::io::Error> for UserMapParseError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::fmt::Display for UserMapParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Io(ref e) => e.fmt(f),
            Self::Line { line, ref error } => write!(f, "line {line}: {error}"),
        }
    }
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NoSeparator => f.write_str("expected \"author = Name <email>\""),
            Self::NoAuthor => f.write_str("empty author"),
            Self::BadRevisions => f.write_str("expected \"@REV\" or \"@FROM:TO\""),
            Self::BadIdentity => f.write_str("identity is not in \"Name <email>\" format"),
            Self::NoEmail => f.write_str("empty or malformed email"),
            Self::Overlaps { first, last } => {
                write!(f, "revisions overlap an earlier entry for r{first}:{last}")
            }
        }
    }
}

impl UserMap {
    pub(crate) fn new() -> Self {
        Self {
            authors: FHashMap::default(),
        }
    }

    pub(crate) fn parse(src: &mut dyn std::io::BufRead) -> Result<Self, UserMapParseError> {
        let mut map = Self::new();
        for (i, line) in std::io::BufRead::split(src, b'\n').enumerate() {
            let line = line?;
            let line: &[u8] = if i == 0 {
                line.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&line)
            } else {
                &line
            };
            map.add_line(line)
                .map_err(|error| UserMapParseError::Line { line: i + 1, error })?;
        }
        Ok(map)
    }

    fn add_line(&mut self, line: &[u8]) -> Result<(), LineError> {
        let line = line.trim_ascii();
        if line.is_empty() || line[0] == b'#' {
            return Ok(());
        }

        let (key, identity) = split_once(line, b'=').ok_or(LineError::NoSeparator)?;
        let (author, (first, last)) = match split_once(key, b'@') {
            Some((author, revs)) => (author.trim_ascii(), parse_revs(revs.trim_ascii())?),
            None => (key.trim_ascii(), (0, u32::MAX)),
        };
        if author.is_empty() {
            return Err(LineError::NoAuthor);
        }
        let identity = parse_identity(identity, author)?;

        let mappings = self.authors.entry(author.to_vec()).or_default();
        if let Some(other) = mappings.iter().find(|m| m.first <= last && first <= m.last) {
            return Err(LineError::Overlaps {
                first: other.first,
                last: other.last,
            });
        }
        mappings.push(Mapping {
            first,
            last,
            identity,
        });
        Ok(())
    }

    /// Identity of `author` at revision `rev`, if any entry covers it.
    pub(crate) fn get(&self, author: &[u8], rev: u32) -> Option<&Identity> {
        self.authors
            .get(author)?
            .iter()
            .find(|m| (m.first..=m.last).contains(&rev))
            .map(|m| &m.identity)
    }
}

fn parse_revs(revs: &[u8]) -> Result<(u32, u32), LineError> {
    let number = |s: &[u8]| -> Result<u32, LineError> {
        std::str::from_utf8(s.trim_ascii())
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(LineError::BadRevisions)
    };
    let (first, last) = match split_once(revs, b':') {
        Some((first, last)) => (number(first)?, number(last)?),
        None => {
            let rev = number(revs)?;
            (rev, rev)
        }
    };
    if first > last {
        return Err(LineError::BadRevisions);
    }
    Ok((first, last))
}

/// `Name <email>`; an empty name falls back to the svn author.
fn parse_identity(raw: &[u8], author: &[u8]) -> Result<Identity, LineError> {
    let raw = std::str::from_utf8(raw.trim_ascii()).map_err(|_| LineError::BadIdentity)?;
    let (name, rest) = raw.split_once('<').ok_or(LineError::BadIdentity)?;
    let email = rest.strip_suffix('>').ok_or(LineError::BadIdentity)?.trim();
    if email.is_empty() || email.contains(|c: char| c.is_whitespace() || c == '<' || c == '>') {
        return Err(LineError::NoEmail);
    }

    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let name = if name.is_empty() {
        String::from_utf8_lossy(author).into_owned()
    } else {
        name
    };
    Ok(Identity {
        name,
        email: email.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::{Identity, LineError, UserMap, UserMapParseError};

    fn parse(src: &str) -> Result<UserMap, UserMapParseError> {
        UserMap::parse(&mut src.as_bytes())
    }

    fn line_error(src: &str) -> (usize, LineError) {
        match parse(src) {
            Err(UserMapParseError::Line { line, error }) => (line, error),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("parsed {src:?}"),
        }
    }

    fn identity(name: &str, email: &str) -> Identity {
        Identity {
            name: name.into(),
            email: email.into(),
        }
    }

    #[test]
    fn test_lookup() {
        let map = parse(
            "\u{feff}# svn authors\r\n\
             \r\n\
             alice = Alice  Liddell <alice@example.com>\r\n\
             bob@1:40 = Bob <bob@old.example.com>\n\
             bob @ 41 = Bob <bob@tmp.example.com>\n\
             bob@42:4294967295=Bob <bob@example.com>",
        )
        .unwrap();

        assert_eq!(
            map.get(b"alice", 7),
            Some(&identity("Alice Liddell", "alice@example.com")),
        );
        assert_eq!(map.get(b"bob", 1).unwrap().email, "bob@old.example.com");
        assert_eq!(map.get(b"bob", 40).unwrap().email, "bob@old.example.com");
        assert_eq!(map.get(b"bob", 41).unwrap().email, "bob@tmp.example.com");
        assert_eq!(map.get(b"bob", 9000).unwrap().email, "bob@example.com");
        assert_eq!(map.get(b"bob", 0), None);
        assert_eq!(map.get(b"carol", 1), None);
    }

    #[test]
    fn test_empty_name() {
        let map = parse("build-bot = <ci@example.com>\n").unwrap();
        assert_eq!(
            map.get(b"build-bot", 3),
            Some(&identity("build-bot", "ci@example.com")),
        );
    }

    #[test]
    fn test_errors() {
        assert_eq!(line_error("\nalice Alice <a@x>"), (2, LineError::NoSeparator));
        assert_eq!(line_error(" @3 = A <a@x>"), (1, LineError::NoAuthor));
        assert_eq!(line_error("a@x = A <a@x>"), (1, LineError::BadRevisions));
        assert_eq!(line_error("a@5:4 = A <a@x>"), (1, LineError::BadRevisions));
        assert_eq!(line_error("a = Alice"), (1, LineError::BadIdentity));
        assert_eq!(line_error("a = Alice <a@x> trailing"), (1, LineError::BadIdentity));
        assert_eq!(line_error("a = Alice <>"), (1, LineError::NoEmail));
        assert_eq!(line_error("a = Alice <a @x>"), (1, LineError::NoEmail));
        assert_eq!(
            line_error("a@1:10 = A <a@x>\n# later\na@10:20 = A <a@y>\n"),
            (3, LineError::Overlaps { first: 1, last: 10 }),
        );
        assert_eq!(
            line_error("a = A <a@x>\na@3 = A <a@y>\n"),
            (2, LineError::Overlaps { first: 0, last: u32::MAX }),
        );

        let e = parse("a = Alice\n").err().unwrap();
        assert_eq!(
            e.to_string(),
            "line 1: identity is not in \"Name <email>\" format",
        );
    }
}

/// Splits `s` at the first occurrence of `sep`, excluding it.
fn split_once(s: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let i = s.iter().position(|&b| b == sep)?;
    Some((&s[..i], &s[i + 1..]))
}
