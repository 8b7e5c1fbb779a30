use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ArgMatches;

use crate::campaign;

/// Exit status of the process
/// when interrupted by the user.
pub(crate) const EXIT_INTERRUPTED: i32 = 130;

/// Base directory given on the command line, defaults to the current
/// working directory.
pub(crate) fn base_dir(matches: &ArgMatches) -> Result<PathBuf> {
    let dir = match matches.value_of("base-dir") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir()?,
    };
    if !dir.is_dir() {
        return Err(anyhow::Error::msg(format!(
            "base directory {} doesn't exist",
            dir.display()
        )));
    }
    Ok(dir.canonicalize()?)
}

/// Maps an error to the exit status of the process.
pub(crate) fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<campaign::Error>() {
        Some(campaign::Error::Interrupted) => EXIT_INTERRUPTED,
        Some(e) => e.exit_code(),
        None => 1,
    }
}

/// Asks the user a yes/no question on the terminal.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"))
}

/// Lists `run_XXX` directories found directly within `dir`.
pub(crate) fn run_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !dir.is_dir() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_run_dir_name(&name) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn is_run_dir_name(name: &str) -> bool {
    match name.strip_prefix("run_") {
        Some(id) => !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[test]
fn run_dir_names() {
    assert!(is_run_dir_name("run_000"));
    assert!(is_run_dir_name("run_1234"));
    assert!(!is_run_dir_name("run_"));
    assert!(!is_run_dir_name("run_01a"));
    assert!(!is_run_dir_name("template"));
}

#[test]
fn lists_only_run_dirs() {
    let dir = tempfile::tempdir().unwrap();
    for name in &["run_002", "run_000", "runs", "template"] {
        fs::create_dir(dir.path().join(name)).unwrap();
    }
    fs::write(dir.path().join("run_001"), "").unwrap();
    let dirs = run_dirs(dir.path()).unwrap();
    assert_eq!(
        dirs,
        vec![dir.path().join("run_000"), dir.path().join("run_002")]
    );
    assert!(run_dirs(&dir.path().join("missing")).unwrap().is_empty());
}
