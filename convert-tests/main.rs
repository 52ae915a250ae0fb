#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod defs;
mod test;

fn main() -> ExitCode {
    let tests_root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("convert-tests")
        .join("tests")
        .canonicalize()
        .unwrap();

    let args = libtest_mimic::Arguments::from_args();

    let tests = gather_tests(&tests_root)
        .into_iter()
        .map(|(name, path)| {
            libtest_mimic::Trial::test(name, move || test::run_test(&path).map_err(Into::into))
        })
        .collect();

    if libtest_mimic::run(&args, tests).has_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Finds the YAML test definitions under `root`, named by their path
/// relative to it without extension (e.g. `history/branch-merge-resume`).
fn gather_tests(root: &Path) -> BTreeMap<String, PathBuf> {
    let mut tests = BTreeMap::new();
    let mut dir_queue = vec![PathBuf::new()];

    while let Some(sub_dir) = dir_queue.pop() {
        for entry in root.join(&sub_dir).read_dir().unwrap() {
            let entry = entry.unwrap();
            let rel_path = sub_dir.join(entry.file_name());

            if entry.file_type().unwrap().is_dir() {
                dir_queue.push(rel_path);
                continue;
            }

            let extension = rel_path.extension();
            if extension != Some(OsStr::new("yaml")) && extension != Some(OsStr::new("yml")) {
                continue;
            }
            let name = rel_path.with_extension("").to_string_lossy().replace('\\', "/");
            let prev = tests.insert(name, root.join(&rel_path));
            assert!(prev.is_none(), "duplicate test {rel_path:?}");
        }
    }

    tests
}
