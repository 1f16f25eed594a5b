//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the orchestrator's production sources:
//! - No sleep() calls; waiting happens on I/O, timeouts and intervals
//! - No blocking I/O inside async functions
//!
//! The helpers here load production sources with their `#[cfg(test)] mod
//! tests` blocks and test-only modules removed, and classify the function
//! enclosing a given line.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories scanned by the enforcement tests, relative to the
/// workspace root
pub const PRODUCTION_DIRS: &[&str] = &["orchestrator/core/src", "orchestrator/cli/src"];

/// Files that only exist for tests
const TEST_ONLY_FILES: &[&str] = &["test_utils.rs"];

/// One production source file, test code removed
#[derive(Debug)]
pub struct SourceFile {
    /// Path on disk
    pub path: PathBuf,
    /// Lines up to the first `#[cfg(test)] mod tests`
    pub lines: Vec<String>,
}

impl SourceFile {
    /// `path:line - text` for a violation report
    #[must_use]
    pub fn describe(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

/// Workspace root
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every production `.rs` file under [`PRODUCTION_DIRS`]
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            if TEST_ONLY_FILES.contains(&name) {
                continue;
            }
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            files.push(SourceFile {
                path: path.to_path_buf(),
                lines: strip_test_module(&content),
            });
        }
    }
    files
}

/// Lines of `content` before its `#[cfg(test)] mod tests` block
#[must_use]
pub fn strip_test_module(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut end = lines.len();
    for (idx, line) in lines.iter().enumerate() {
        if line.trim() != "#[cfg(test)]" {
            continue;
        }
        let next = lines[idx + 1..]
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty());
        if next.is_some_and(|l| l.starts_with("mod tests")) {
            end = idx;
            break;
        }
    }
    lines[..end].iter().map(|l| (*l).to_string()).collect()
}

/// The part of a line before any `//` comment
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Kind of function a line sits in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enclosing {
    /// `async fn`
    Async,
    /// Plain `fn`
    Sync,
    /// Module level
    None,
}

/// Qualifiers that may precede `fn` in a function header
const FN_QUALIFIERS: &[&str] = &[
    "pub", "pub(crate)", "pub(super)", "async", "const", "unsafe", "extern",
];

/// Classify a line as a function header
#[must_use]
pub fn fn_header(line: &str) -> Option<Enclosing> {
    let tokens: Vec<&str> = code_part(line).split_whitespace().collect();
    let fn_pos = tokens.iter().position(|t| *t == "fn")?;
    if !tokens[..fn_pos].iter().all(|t| FN_QUALIFIERS.contains(t)) {
        return None;
    }
    if tokens[..fn_pos].contains(&"async") {
        Some(Enclosing::Async)
    } else {
        Some(Enclosing::Sync)
    }
}

/// Nearest function header above `idx`
#[must_use]
pub fn enclosing_fn<S: AsRef<str>>(lines: &[S], idx: usize) -> Enclosing {
    (0..=idx)
        .rev()
        .find_map(|i| fn_header(lines[i].as_ref()))
        .unwrap_or(Enclosing::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_header_detection() {
        assert_eq!(fn_header("    pub async fn refresh(&self) {"), Some(Enclosing::Async));
        assert_eq!(fn_header("pub fn load_config() -> Result<()> {"), Some(Enclosing::Sync));
        assert_eq!(fn_header("    fn probe(&self) {"), Some(Enclosing::Sync));
        assert_eq!(fn_header("    let f = |x| x + 1;"), None);
        assert_eq!(fn_header("    // fn commented_out() {"), None);
        assert_eq!(fn_header("let fn_name = 1;"), None);
    }

    #[test]
    fn test_enclosing_fn() {
        let code = [
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
            "fn main() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert_eq!(enclosing_fn(&code, 1), Enclosing::Async);
        assert_eq!(enclosing_fn(&code, 4), Enclosing::Sync);
    }

    #[test]
    fn test_strip_test_module() {
        let content = "fn a() {}\n#[cfg(test)]\npub(crate) mod test_utils;\nfn b() {}\n\n\
                       #[cfg(test)]\n\nmod tests {\n    fn c() {}\n}\n";
        let lines = strip_test_module(content);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[3], "fn b() {}");
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_sources();
        assert!(files.iter().any(|f| f.path.ends_with("dispatch/mod.rs")));
        assert!(files.iter().all(|f| !f.path.ends_with("test_utils.rs")));
    }
}
