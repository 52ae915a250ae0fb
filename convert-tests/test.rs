use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use regex_syntax::hir::{self as regex_hir, Hir};

use crate::defs;

pub(crate) fn run_test(test_path: &Path) -> Result<(), String> {
    let test_def_raw =
        std::fs::read(test_path).map_err(|e| format!("failed to read {test_path:?}: {e}"))?;
    let test_def: defs::Test = serde_yaml::from_slice(&test_def_raw)
        .map_err(|e| format!("failed to parse {test_path:?}: {e}"))?;

    let work_dir = WorkDir::create()?;
    let bin = Path::new(env!("CARGO_BIN_EXE_svnbridge"));

    if let Some(ref user_map) = test_def.user_map {
        work_dir.write("user-map.txt", user_map.as_bytes())?;
    }
    let conv_params_path = work_dir.write("conv-params.toml", test_def.conv_params.as_bytes())?;
    let git_repo_path = work_dir.path.join("converted.git");
    let conv_log_path = work_dir.path.join("conv.log");

    // Earlier steps see a truncated dump and must succeed.
    let steps = test_def
        .fetch_steps
        .iter()
        .map(|&last_rev| (Some(last_rev), 0))
        .chain(std::iter::once((None, test_def.exit_code)));
    for (last_rev, expect_exit_code) in steps {
        let dump = compress(&test_def.compression, &make_svn_dump(&test_def, last_rev))?;
        let svn_dump_path = work_dir.write("svn-dump", &dump)?;

        let out = std::process::Command::new(bin)
            .arg("fetch")
            .arg("--no-progress")
            .arg("--src")
            .arg(&svn_dump_path)
            .arg("--dest")
            .arg(&git_repo_path)
            .arg("--conv-params")
            .arg(&conv_params_path)
            .arg("--log-file")
            .arg(&conv_log_path)
            .output()
            .map_err(|e| format!("failed to run {bin:?}: {e}"))?;

        if out.status.code() != Some(expect_exit_code) {
            let step = last_rev.map_or_else(String::new, |rev| format!(" (fetch up to r{rev})"));
            return Err(format!(
                "svnbridge finished with {} instead of exit code {expect_exit_code}{step}\n\
                 stdout:\n{}stderr:\n{}",
                out.status,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr),
            ));
        }
    }

    if let Some(ref expected_logs) = test_def.logs {
        let log_data = std::fs::read(&conv_log_path)
            .map_err(|e| format!("failed to read {conv_log_path:?}: {e}"))?;
        check_log(&log_data, expected_logs)?;
    }

    if test_def.exit_code != 0 {
        return work_dir.remove();
    }

    git_fsck(&git_repo_path)?;

    let git_repo = gix::open(&git_repo_path)
        .map_err(|e| format!("failed to open git repository {git_repo_path:?}: {e}"))?;

    if let Some(ref expected_refs) = test_def.git_refs {
        check_git_refs(&git_repo, expected_refs)?;
    }
    for git_tag in test_def.git_tags.iter() {
        check_git_tag(&git_repo, git_tag)
            .map_err(|e| format!("tag {:?} check failed: {e}", git_tag.tag))?;
    }
    for git_rev in test_def.git_revs.iter() {
        check_git_rev(&git_repo, git_rev)
            .map_err(|e| format!("revision {:?} check failed: {e}", git_rev.rev))?;
    }
    for svn_log in test_def.svn_log.iter() {
        check_svn_log(bin, &git_repo_path, svn_log).map_err(|e| {
            format!(
                "log of {:?} check failed: {e}",
                svn_log.branch.as_deref().unwrap_or("HEAD"),
            )
        })?;
    }

    work_dir.remove()
}

/// Scratch directory of a single test, left behind on failure for
/// inspection.
struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    fn create() -> Result<Self, String> {
        loop {
            let mut path = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
            path.push(format!("convert-test-{:08x}", rand::random::<u32>()));

            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(format!("failed to create directory {path:?}: {e}")),
            }
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<PathBuf, String> {
        let path = self.path.join(name);
        std::fs::write(&path, data).map_err(|e| format!("failed to write {path:?}: {e}"))?;
        Ok(path)
    }

    fn remove(self) -> Result<(), String> {
        std::fs::remove_dir_all(&self.path)
            .map_err(|e| format!("failed to remove {:?}: {e}", self.path))
    }
}

fn compress(compression: &defs::Compression, dump: &[u8]) -> Result<Vec<u8>, String> {
    fn encode_with<W: std::io::Write>(
        encoder: W,
        dump: &[u8],
        finish: impl FnOnce(W) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let mut encoder = encoder;
        encoder.write_all(dump)?;
        finish(encoder)
    }

    let mut out = Vec::new();
    let r = match compression {
        defs::Compression::None => {
            out.extend(dump);
            Ok(())
        }
        defs::Compression::Gzip => encode_with(
            flate2::write::GzEncoder::new(&mut out, flate2::Compression::default()),
            dump,
            |e| e.finish().map(drop),
        ),
        defs::Compression::Bzip2 => encode_with(
            bzip2::write::BzEncoder::new(&mut out, bzip2::Compression::default()),
            dump,
            |e| e.finish().map(drop),
        ),
        defs::Compression::Xz => {
            liblzma::encode_all(dump, 6).map(|compressed| out = compressed)
        }
        defs::Compression::Zstd => {
            zstd::encode_all(dump, 3).map(|compressed| out = compressed)
        }
        defs::Compression::Lz4 => encode_with(
            lz4_flex::frame::FrameEncoder::new(&mut out),
            dump,
            |e| e.finish().map(drop).map_err(std::io::Error::other),
        ),
    };
    r.map_err(|e| format!("failed to compress dump: {e}"))?;
    Ok(out)
}

/// Builds a dump with the revisions of `test_def` up to `last_rev`.
fn make_svn_dump(test_def: &defs::Test, last_rev: Option<u32>) -> Vec<u8> {
    let mut dump = DumpOut::default();

    dump.header("SVN-fs-dump-format-version", "2");
    if let Some(ref svn_uuid) = test_def.svn_uuid {
        dump.header("UUID", svn_uuid);
    }
    dump.revision(0, &BTreeMap::new());

    let mut prev_rev_no = 0;
    for svn_rev in test_def.svn_revs.iter() {
        let rev_no = svn_rev.no.unwrap_or(prev_rev_no + 1);
        if last_rev.is_some_and(|last_rev| rev_no > last_rev) {
            break;
        }
        dump.revision(rev_no, &svn_rev.props);

        for node in svn_rev.nodes.iter() {
            let mut headers = vec![
                ("Node-path", node.path.clone()),
                ("Node-kind", node.kind.header_value().into()),
                ("Node-action", node.action.header_value().into()),
            ];
            if let Some(ref copy_from_path) = node.copy_from_path {
                let copy_from_rev = node.copy_from_rev.unwrap_or(prev_rev_no);
                headers.push(("Node-copyfrom-rev", copy_from_rev.to_string()));
                headers.push(("Node-copyfrom-path", copy_from_path.clone()));
            }

            let props = node.props.as_ref().map(|props| {
                prop_block(
                    props
                        .iter()
                        .map(|(k, v)| (k.as_bytes(), v.as_ref().map(String::as_bytes))),
                )
            });
            dump.record(&headers, props.as_deref(), node.text.as_deref().map(str::as_bytes));
        }

        prev_rev_no = rev_no;
    }

    dump.out
}

#[derive(Default)]
struct DumpOut {
    out: Vec<u8>,
}

impl DumpOut {
    fn header(&mut self, key: &str, value: &str) {
        writeln!(self.out, "{key}: {value}\n").unwrap();
    }

    fn record(&mut self, headers: &[(&str, String)], props: Option<&[u8]>, text: Option<&[u8]>) {
        for (key, value) in headers.iter() {
            writeln!(self.out, "{key}: {value}").unwrap();
        }
        if let Some(props) = props {
            writeln!(self.out, "Prop-content-length: {}", props.len()).unwrap();
        }
        if let Some(text) = text {
            writeln!(self.out, "Text-content-length: {}", text.len()).unwrap();
        }
        let content_len = props.map_or(0, <[u8]>::len) + text.map_or(0, <[u8]>::len);
        writeln!(self.out, "Content-length: {content_len}\n").unwrap();
        self.out.extend(props.unwrap_or_default());
        self.out.extend(text.unwrap_or_default());
        self.out.push(b'\n');
    }

    fn revision(&mut self, rev_no: u32, props: &BTreeMap<String, String>) {
        let props = prop_block(props.iter().map(|(k, v)| (k.as_bytes(), Some(v.as_bytes()))));
        self.record(&[("Revision-number", rev_no.to_string())], Some(&props), None);
    }
}

/// Serializes a property list; `None` values are deletions.
fn prop_block<'a>(props: impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in props {
        match value {
            Some(value) => {
                writeln!(out, "K {}", key.len()).unwrap();
                out.extend(key);
                writeln!(out, "\nV {}", value.len()).unwrap();
                out.extend(value);
            }
            None => {
                writeln!(out, "D {}", key.len()).unwrap();
                out.extend(key);
            }
        }
        out.push(b'\n');
    }
    out.extend(b"PROPS-END\n");
    out
}

/// Checks that every pattern line appears in the log, in order. A pattern
/// line is a level letter (`E`, `W`, `I` or `D`) followed by the target
/// and message, and is matched against a whole log line.
fn check_log(log_data: &[u8], expected: &str) -> Result<(), String> {
    fn digits(n: u32) -> Hir {
        Hir::repetition(regex_hir::Repetition {
            min: n,
            max: Some(n),
            greedy: true,
            sub: Box::new(Hir::class(regex_hir::Class::Bytes(
                regex_hir::ClassBytes::new([regex_hir::ClassBytesRange::new(b'0', b'9')]),
            ))),
        })
    }

    // 2011-05-01T10:01:00.000000Z
    let mut timestamp = Vec::new();
    for (n, sep) in [(4, "-"), (2, "-"), (2, "T"), (2, ":"), (2, ":"), (2, "."), (6, "Z ")] {
        timestamp.push(digits(n));
        timestamp.push(Hir::literal(sep.as_bytes()));
    }

    let mut log_lines = log_data.split(|&c| c == b'\n');
    for pattern_line in expected.lines().filter(|l| !l.is_empty()) {
        let (level, message) = match pattern_line.split_once(' ') {
            Some(("E", message)) => ("ERROR ", message),
            Some(("W", message)) => (" WARN ", message),
            Some(("I", message)) => (" INFO ", message),
            Some(("D", message)) => ("DEBUG ", message),
            _ => return Err(format!("invalid log pattern line: {pattern_line:?}")),
        };

        let mut hir = vec![Hir::look(regex_hir::Look::Start)];
        hir.extend(timestamp.iter().cloned());
        hir.push(Hir::literal(level.as_bytes()));
        hir.push(Hir::literal(message.as_bytes()));
        hir.push(Hir::look(regex_hir::Look::End));
        let regex = regex_automata::meta::Builder::new()
            .build_from_hir(&Hir::concat(hir))
            .map_err(|e| format!("failed to build regex for {pattern_line:?}: {e}"))?;

        if !log_lines.any(|line| regex.is_match(line)) {
            return Err(format!(
                "log line {pattern_line:?} not found (or out of order) in:\n{}",
                String::from_utf8_lossy(log_data),
            ));
        }
    }

    Ok(())
}

fn git_fsck(git_repo_path: &Path) -> Result<(), String> {
    let out = std::process::Command::new("git")
        .current_dir(git_repo_path)
        .args(["fsck", "--strict", "--no-progress"])
        .output()
        .map_err(|e| format!("failed to run git fsck: {e}"))?;
    if !out.status.success() {
        return Err(format!(
            "git fsck finished with {}\nstdout:\n{}\nstderr:\n{}",
            out.status,
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr),
        ));
    }
    Ok(())
}

fn check_svn_log(bin: &Path, git_repo_path: &Path, svn_log: &defs::SvnLog) -> Result<(), String> {
    let mut cmd = std::process::Command::new(bin);
    cmd.arg("log")
        .arg("--repo")
        .arg(git_repo_path)
        .arg("--template")
        .arg(&svn_log.template);
    if let Some(ref branch) = svn_log.branch {
        cmd.arg("--branch").arg(branch);
    }

    let out = cmd
        .output()
        .map_err(|e| format!("failed to run {bin:?}: {e}"))?;
    if !out.status.success() {
        return Err(format!(
            "log finished with {}\nstderr:\n{}",
            out.status,
            String::from_utf8_lossy(&out.stderr),
        ));
    }
    if out.stdout != svn_log.output.as_bytes() {
        return Err(format!(
            "unexpected output: \"{}\" != \"{}\"",
            out.stdout.escape_ascii(),
            svn_log.output.as_bytes().escape_ascii(),
        ));
    }
    Ok(())
}

fn check_git_refs(git_repo: &gix::Repository, expected: &BTreeSet<String>) -> Result<(), String> {
    let platform = git_repo
        .references()
        .map_err(|e| format!("failed to open references: {e}"))?;
    let mut actual = BTreeSet::new();
    for reference in platform
        .all()
        .map_err(|e| format!("failed to list references: {e}"))?
    {
        let reference = reference.map_err(|e| format!("failed to read reference: {e}"))?;
        let name = reference.name().as_bstr().to_string();
        if name.starts_with("refs/") {
            actual.insert(name);
        }
    }

    if actual != *expected {
        return Err(format!("unexpected refs: {actual:?} != {expected:?}"));
    }
    Ok(())
}

fn rev_parse<'r>(git_repo: &'r gix::Repository, spec: &str) -> Result<gix::Id<'r>, String> {
    git_repo
        .rev_parse_single(spec)
        .map_err(|e| format!("failed to revparse {spec:?}: {e}"))
}

fn check_git_tag(git_repo: &gix::Repository, git_tag: &defs::GitTag) -> Result<(), String> {
    let tag: gix::objs::Tag = rev_parse(git_repo, &git_tag.tag)?
        .object()
        .map_err(|e| format!("failed to get object: {e}"))?
        .try_into_tag()
        .map_err(|e| format!("failed to get tag: {e}"))?
        .decode()
        .map_err(|e| format!("failed to decode tag: {e}"))?
        .try_into()
        .map_err(|e| format!("failed to decode tag: {e}"))?;

    if tag.target != rev_parse(git_repo, &git_tag.rev)? {
        return Err(format!("tag does not point to {:?}", git_tag.rev));
    }
    if let Some(ref expected_tagger) = git_tag.tagger {
        let tagger = tag.tagger.as_ref().ok_or("tag does not have tagger")?;
        let mut time_buf = gix::date::parse::TimeBuf::default();
        check_git_signature("tagger", &tagger.to_ref(&mut time_buf), expected_tagger)?;
    }
    if let Some(ref expected_msg) = git_tag.message {
        if tag.message != *expected_msg {
            return Err(format!(
                "unexpected tag message: {:?} != {expected_msg:?}",
                tag.message,
            ));
        }
    }
    Ok(())
}

fn check_git_rev(git_repo: &gix::Repository, git_rev: &defs::GitRev) -> Result<(), String> {
    let id = rev_parse(git_repo, &git_rev.rev)?;
    let commit = id
        .object()
        .map_err(|e| format!("failed to get object: {e}"))?
        .try_into_commit()
        .map_err(|e| format!("failed to get commit: {e}"))?;

    if let Some(ref expected) = git_rev.author {
        let author = commit
            .author()
            .map_err(|e| format!("failed to get author: {e}"))?;
        check_git_signature("author", &author, expected)?;
    }
    if let Some(ref expected) = git_rev.committer {
        let committer = commit
            .committer()
            .map_err(|e| format!("failed to get committer: {e}"))?;
        check_git_signature("committer", &committer, expected)?;
    }

    if let Some(ref expected_msg) = git_rev.message {
        let msg = commit
            .message_raw()
            .map_err(|e| format!("failed to get message: {e}"))?;
        if msg != expected_msg {
            return Err(format!("unexpected message: {msg:?} != {expected_msg:?}"));
        }
    }

    for same in git_rev.same.iter().flatten() {
        if rev_parse(git_repo, same)? != id {
            return Err(format!("{same:?} is a different commit"));
        }
    }

    if let Some(ref expected_parents) = git_rev.parents {
        let parents: Vec<_> = commit.parent_ids().collect();
        let expected: Vec<_> = expected_parents
            .iter()
            .map(|spec| rev_parse(git_repo, spec))
            .collect::<Result<_, _>>()?;
        if parents != expected {
            return Err(format!(
                "unexpected parents: {parents:?} != {expected:?} ({expected_parents:?})"
            ));
        }
    }

    if let Some(ref expected_tree) = git_rev.tree {
        let tree_id = commit
            .tree_id()
            .map_err(|e| format!("failed to get tree ID: {e}"))?;
        check_git_tree(tree_id, expected_tree)?;
    }

    Ok(())
}

fn check_git_signature(
    which: &str,
    actual: &gix::actor::SignatureRef<'_>,
    expected: &defs::Signature,
) -> Result<(), String> {
    if actual.name != expected.name || actual.email != expected.email {
        return Err(format!(
            "unexpected {which}: \"{} <{}>\" != \"{} <{}>\"",
            actual.name, actual.email, expected.name, expected.email,
        ));
    }

    if let Some(ref expected_time) = expected.time {
        let time = actual
            .time()
            .map_err(|e| format!("invalid {which} time {:?}: {e}", actual.time))?;
        let actual_time = defs::SignatureTime {
            seconds: time.seconds,
            offset: time.offset,
        };
        if actual_time != *expected_time {
            return Err(format!(
                "unexpected {which} time: {actual_time} != {expected_time}"
            ));
        }
    }

    Ok(())
}

/// Compares the whole tree recursively, directories included.
fn check_git_tree(
    root_tree_id: gix::Id<'_>,
    expected: &BTreeMap<String, defs::TreeEntry>,
) -> Result<(), String> {
    let mut actual = BTreeMap::new();
    let mut queue = vec![(String::new(), root_tree_id)];
    while let Some((prefix, tree_id)) = queue.pop() {
        let tree = tree_id
            .object()
            .map_err(|e| format!("failed to get object {tree_id}: {e}"))?
            .try_into_tree()
            .map_err(|e| format!("object {tree_id} is not a tree: {e}"))?;

        for entry in tree.iter() {
            let entry = entry.map_err(|e| format!("failed to read tree entry: {e}"))?;
            let name = entry.filename().to_string();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.mode().is_tree() {
                queue.push((path.clone(), entry.id()));
            }
            actual.insert(path, (entry.mode(), entry.id()));
        }
    }

    let missing: Vec<_> = expected.keys().filter(|p| !actual.contains_key(*p)).collect();
    let unexpected: Vec<_> = actual.keys().filter(|p| !expected.contains_key(*p)).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(format!(
            "missing tree entries: {missing:?}, unexpected tree entries: {unexpected:?}"
        ));
    }

    for (path, expected_entry) in expected.iter() {
        let (mode, id) = actual[path];
        let (kind_ok, what, data) = match expected_entry {
            defs::TreeEntry::Normal { data } => {
                (mode.is_blob() && !mode.is_executable(), "a regular file", Some(data))
            }
            defs::TreeEntry::Exec { data } => {
                (mode.is_blob() && mode.is_executable(), "an executable file", Some(data))
            }
            defs::TreeEntry::Symlink { target } => (mode.is_link(), "a symbolic link", Some(target)),
            defs::TreeEntry::Dir => (mode.is_tree(), "a directory", None),
        };
        if !kind_ok {
            return Err(format!(
                "entry {path:?} with mode {} was expected to be {what}",
                mode.kind().as_octal_str(),
            ));
        }

        if let Some(expected_data) = data {
            let blob = id
                .object()
                .map_err(|e| format!("failed to get object {id}: {e}"))?
                .into_blob();
            if blob.data != expected_data.as_bytes() {
                return Err(format!(
                    "incorrect data in entry {path:?}: expected: \"{}\"\nactual: \"{}\"",
                    expected_data.as_bytes().escape_ascii(),
                    blob.data.escape_ascii(),
                ));
            }
        }
    }

    Ok(())
}
