//! `svn:externals` parsing and the `.svnexternals` metadata file.

use std::collections::BTreeMap;

pub(crate) const EXTERNALS_FILE: &[u8] = b".svnexternals";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ExternalDefinition {
    pub(crate) target: Vec<u8>,
    pub(crate) url: Vec<u8>,
    pub(crate) peg: Option<u32>,
    pub(crate) revision: Option<u32>,
}

/// Externals of a branch, keyed by the directory (relative to the branch
/// root, `.` for the root) that carries the property.
pub(crate) type ExternalsMap = BTreeMap<Vec<u8>, Vec<ExternalDefinition>>;

/// Unparseable line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SyntaxError {
    pub(crate) line: Vec<u8>,
}

fn is_url(token: &[u8]) -> bool {
    token.windows(3).any(|w| w == b"://")
        || token.starts_with(b"^/")
        || token.starts_with(b"//")
        || token.starts_with(b"/")
        || token.starts_with(b"../")
}

/// Splits a line on whitespace, honoring quotes and backslash escapes.
fn tokenize(line: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut tokens = Vec::new();
    let mut cur: Option<Vec<u8>> = None;
    let mut quote = None;
    let mut iter = line.iter().copied();
    while let Some(c) = iter.next() {
        match c {
            b'\\' => {
                let escaped = iter.next()?;
                cur.get_or_insert_with(Vec::new).push(escaped);
            }
            b'"' | b'\'' if quote.is_none() => {
                quote = Some(c);
                cur.get_or_insert_with(Vec::new);
            }
            _ if quote == Some(c) => quote = None,
            b' ' | b'\t' if quote.is_none() => {
                if let Some(token) = cur.take() {
                    tokens.push(token);
                }
            }
            _ => cur.get_or_insert_with(Vec::new).push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    tokens.extend(cur);
    Some(tokens)
}

fn parse_rev(s: &[u8]) -> Option<u32> {
    std::str::from_utf8(s).ok()?.parse().ok()
}

/// Consumes a leading `-r N` / `-rN` option.
fn take_revision(tokens: &mut Vec<Vec<u8>>) -> Option<Option<u32>> {
    let Some(first) = tokens.first() else {
        return Some(None);
    };
    if first.as_slice() == b"-r" {
        if tokens.len() < 2 {
            return None;
        }
        let rev = parse_rev(&tokens[1])?;
        tokens.drain(..2);
        Some(Some(rev))
    } else if let Some(rev) = first.strip_prefix(b"-r") {
        let rev = parse_rev(rev)?;
        tokens.remove(0);
        Some(Some(rev))
    } else {
        Some(None)
    }
}

fn split_peg(url: &[u8]) -> Option<(Vec<u8>, Option<u32>)> {
    // only the last component can carry a peg revision
    let name_start = url.iter().rposition(|&c| c == b'/').map_or(0, |i| i + 1);
    match url[name_start..].iter().rposition(|&c| c == b'@') {
        Some(at) => {
            let at = name_start + at;
            Some((url[..at].to_vec(), Some(parse_rev(&url[(at + 1)..])?)))
        }
        None => Some((url.to_vec(), None)),
    }
}

fn parse_line(line: &[u8]) -> Option<ExternalDefinition> {
    let mut tokens = tokenize(line)?;
    if tokens.first().is_some_and(|t| !t.starts_with(b"-r") && !is_url(t)) {
        // old syntax: TARGET [-r N] URL
        let target = tokens.remove(0);
        let revision = take_revision(&mut tokens)?;
        let [url] = <[Vec<u8>; 1]>::try_from(tokens).ok()?;
        if !is_url(&url) {
            return None;
        }
        return Some(ExternalDefinition {
            target,
            url,
            peg: None,
            revision,
        });
    }

    let revision = take_revision(&mut tokens)?;
    let [url, target] = <[Vec<u8>; 2]>::try_from(tokens).ok()?;
    let (url, peg) = split_peg(&url)?;
    Some(ExternalDefinition {
        target,
        url,
        peg,
        revision,
    })
}

/// Parses an `svn:externals` property value. Any bad line rejects the
/// whole property.
pub(crate) fn parse(value: &[u8]) -> Result<Vec<ExternalDefinition>, SyntaxError> {
    let mut defs = Vec::new();
    for line in value.split(|&c| c == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() || line.starts_with(b"#") {
            continue;
        }
        let def = parse_line(line).ok_or_else(|| SyntaxError {
            line: line.to_vec(),
        })?;
        if def.target.is_empty() || def.target.split(|&c| c == b'/').any(|c| c == b"..") {
            return Err(SyntaxError {
                line: line.to_vec(),
            });
        }
        defs.push(def);
    }
    defs.sort();
    defs.dedup();
    Ok(defs)
}

fn needs_quotes(s: &[u8]) -> bool {
    s.iter().any(|&c| matches!(c, b' ' | b'\t' | b'"' | b'\'' | b'\\'))
}

fn push_quoted(out: &mut Vec<u8>, s: &[u8]) {
    if !needs_quotes(s) {
        out.extend(s);
        return;
    }
    out.push(b'"');
    for &c in s {
        if matches!(c, b'"' | b'\\') {
            out.push(b'\\');
        }
        out.push(c);
    }
    out.push(b'"');
}

fn push_definition(out: &mut Vec<u8>, def: &ExternalDefinition) {
    if let Some(rev) = def.revision {
        out.extend(format!("-r{rev} ").as_bytes());
    }
    let mut url = def.url.clone();
    if let Some(peg) = def.peg {
        url.extend(format!("@{peg}").as_bytes());
    }
    push_quoted(out, &url);
    out.push(b' ');
    push_quoted(out, &def.target);
}

/// Renders the `.svnexternals` file. Returns `None` when there are no
/// externals.
pub(crate) fn encode(map: &ExternalsMap) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for (dir, defs) in map.iter() {
        if defs.is_empty() {
            continue;
        }
        out.push(b'[');
        out.extend(dir);
        out.extend(b"]\n");
        let mut defs: Vec<&ExternalDefinition> = defs.iter().collect();
        defs.sort_by(|a, b| a.target.cmp(&b.target).then_with(|| a.cmp(b)));
        for def in defs {
            out.push(b' ');
            push_definition(&mut out, def);
            out.push(b'\n');
        }
    }
    (!out.is_empty()).then_some(out)
}

pub(crate) fn decode(data: &[u8]) -> Result<ExternalsMap, SyntaxError> {
    let mut map = ExternalsMap::new();
    let mut cur_dir: Option<Vec<u8>> = None;
    for line in data.split(|&c| c == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(dir) = line.strip_prefix(b"[").and_then(|l| l.strip_suffix(b"]")) {
            map.entry(dir.to_vec()).or_default();
            cur_dir = Some(dir.to_vec());
        } else if let (Some(dir), Some(def_line)) = (&cur_dir, line.strip_prefix(b" ")) {
            let def = parse_line(def_line).ok_or_else(|| SyntaxError {
                line: line.to_vec(),
            })?;
            map.entry(dir.clone()).or_default().push(def);
        } else {
            return Err(SyntaxError {
                line: line.to_vec(),
            });
        }
    }
    Ok(map)
}

/// Renders definitions as an `svn:externals` property value.
pub(crate) fn to_property(defs: &[ExternalDefinition]) -> Vec<u8> {
    let mut out = Vec::new();
    for def in defs {
        push_definition(&mut out, def);
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{ExternalDefinition, ExternalsMap, decode, encode, parse, to_property};

    fn def(target: &str, url: &str, peg: Option<u32>, revision: Option<u32>) -> ExternalDefinition {
        ExternalDefinition {
            target: target.into(),
            url: url.into(),
            peg,
            revision,
        }
    }

    #[test]
    fn test_parse_new_syntax() {
        let value = b"-r2 ^/externals/project2@2 deps/project2\n\
            # comment\n\
            \n\
            ^/externals/project1 deps/project1\n\
            -r 5 http://example.com/svn/lib \"third party/lib\"\n";
        assert_eq!(
            parse(value).unwrap(),
            [
                def("deps/project1", "^/externals/project1", None, None),
                def("deps/project2", "^/externals/project2", Some(2), Some(2)),
                def("third party/lib", "http://example.com/svn/lib", None, Some(5)),
            ],
        );
    }

    #[test]
    fn test_parse_old_syntax() {
        assert_eq!(
            parse(b"lib -r3 http://example.com/svn/lib\nvendor http://example.com/v\n")
                .unwrap(),
            [
                def("lib", "http://example.com/svn/lib", None, Some(3)),
                def("vendor", "http://example.com/v", None, None),
            ],
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse(b"^/a deps/a\nnot valid at all\n").unwrap_err().line,
            b"not valid at all",
        );
        assert!(parse(b"^/a \"unterminated\n").is_err());
        assert!(parse(b"^/a ../escape\n").is_err());
        assert!(parse(b"-rX ^/a deps/a\n").is_err());
    }

    #[test]
    fn test_encode_is_stable() {
        let mut map = ExternalsMap::new();
        map.insert(
            b"subdir".to_vec(),
            vec![def("deps/project1", "^/externals/project1", None, None)],
        );
        map.insert(
            b".".to_vec(),
            vec![def("deps/project2", "^/externals/project2", Some(2), Some(2))],
        );
        map.insert(b"empty".to_vec(), Vec::new());

        let encoded = encode(&map).unwrap();
        assert_eq!(
            encoded,
            b"[.]\n -r2 ^/externals/project2@2 deps/project2\n\
              [subdir]\n ^/externals/project1 deps/project1\n",
        );

        let decoded = decode(&encoded).unwrap();
        assert_eq!(encode(&decoded).unwrap(), encoded);
        assert_eq!(encode(&ExternalsMap::new()), None);
    }

    #[test]
    fn test_to_property() {
        let defs = [
            def("a b", "^/x", None, None),
            def("c", "^/y", Some(4), Some(3)),
        ];
        let value = to_property(&defs);
        assert_eq!(value, b"^/x \"a b\"\n-r3 ^/y@4 c\n");
        assert_eq!(parse(&value).unwrap(), defs);
    }
}
