//! Static capability scan for strategy uploads
//!
//! A deny-list pass over every source file in an upload, run before the entry
//! point is instantiated. The list names capability-bearing module paths
//! (filesystem, network, process control, dynamic loading) and constructs
//! that would let strategy code escape the single-method contract. Scanning is
//! textual and deliberately coarse: a competition upload has no legitimate use
//! for any of these, so false positives are acceptable and appealable by
//! re-upload.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ArenaError, Result};

/// Module paths a strategy may never reference.
pub const DENIED_MODULES: &[&str] = &[
    // Filesystem
    "std::fs",
    "tokio::fs",
    // Network
    "std::net",
    "tokio::net",
    "reqwest",
    "hyper",
    "socket2",
    // Process & system control
    "std::process",
    "tokio::process",
    "std::env",
    "libc",
    "nix::",
    // Dynamic loading & FFI
    "libloading",
    "std::arch",
    // Thread spawning escapes the invocation deadline
    "std::thread",
];

/// Language constructs a strategy may never use.
pub const DENIED_TOKENS: &[&str] = &[
    "unsafe",
    "include!",
    "include_str!",
    "include_bytes!",
    "env!",
    "option_env!",
    "asm!",
    "extern \"C\"",
];

/// One denied reference found in an upload.
#[derive(Debug, Clone)]
pub struct Violation {
    pub file: PathBuf,
    pub line: usize,
    pub what: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: denied `{}`", self.file.display(), self.line, self.what)
    }
}

/// Scan one source file's contents.
pub fn scan_source(file: &Path, code: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (idx, raw_line) in code.lines().enumerate() {
        // Comments don't grant capabilities
        let line = raw_line.split("//").next().unwrap_or("");
        if line.trim().is_empty() {
            continue;
        }
        for module in DENIED_MODULES {
            if line.contains(module) {
                violations.push(Violation {
                    file: file.to_path_buf(),
                    line: idx + 1,
                    what: (*module).trim_end_matches("::").to_string(),
                });
            }
        }
        for token in DENIED_TOKENS {
            if line.contains(token) {
                violations.push(Violation {
                    file: file.to_path_buf(),
                    line: idx + 1,
                    what: (*token).to_string(),
                });
            }
        }
    }
    violations
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, files)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
    Ok(())
}

/// Scan every `.rs` file under an upload directory.
pub fn scan_upload(dir: &Path) -> Result<Vec<Violation>> {
    if !dir.is_dir() {
        return Err(ArenaError::StrategyLoad(format!(
            "strategy directory {} not found",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    walk(dir, &mut files)?;
    files.sort();

    let mut violations = Vec::new();
    for file in files {
        let code = fs::read_to_string(&file)?;
        violations.extend(scan_source(&file, &code));
    }
    Ok(violations)
}
