//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! of the tether crates:
//! - No blocking I/O on the async runtime
//! - Sleeping only where a backoff or deadline is the point
//! - Errors are propagated, not unwrapped
//!
//! The helpers here walk the production sources and hand each test the lines
//! that run outside `#[cfg(test)]` modules.

use std::fs;
use std::path::{Path, PathBuf};

/// One line of production code
#[derive(Clone, Debug)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: String,
}

impl SourceLine {
    /// Path relative to the workspace root, for readable reports
    #[must_use]
    pub fn location(&self) -> String {
        let root = workspace_root();
        let shown = self.path.strip_prefix(&root).unwrap_or(&self.path);
        format!("{}:{}", shown.display(), self.number)
    }
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// Source directories checked by every rule
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("tether/core/src"), root.join("tether/cli/src")]
}

/// Strip a trailing line comment; whole-line comments become empty
#[must_use]
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    match line.find(" //") {
        Some(idx) if !line[..idx].contains('"') => &line[..idx],
        _ => line,
    }
}

/// Production lines of one file: everything before the first `#[cfg(test)]`
#[must_use]
pub fn production_lines_of(path: &Path, content: &str) -> Vec<SourceLine> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: code_part(line).to_string(),
        })
        .filter(|line| !line.code.trim().is_empty())
        .collect()
}

/// Production lines of every `.rs` file under the production directories
#[must_use]
pub fn production_lines() -> Vec<SourceLine> {
    let mut lines = Vec::new();
    for dir in production_dirs() {
        for entry in walkdir::WalkDir::new(&dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        {
            if let Ok(content) = fs::read_to_string(entry.path()) {
                lines.extend(production_lines_of(entry.path(), &content));
            }
        }
    }
    lines
}

/// Whether `path` lies under `<workspace>/<relative>`
#[must_use]
pub fn is_under(path: &Path, relative: &str) -> bool {
    path.starts_with(workspace_root().join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("    // std::fs::read"), "");
        assert_eq!(code_part("let x = 1; // note"), "let x = 1;");
        assert_eq!(code_part("let url = \"http://x\";"), "let url = \"http://x\";");
    }

    #[test]
    fn test_test_modules_are_skipped() {
        let content = "fn real() {}\n\n#[cfg(test)]\nmod tests {\n    fn helper() { x.unwrap(); }\n}\n";
        let lines = production_lines_of(Path::new("lib.rs"), content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].number, 1);
    }

    #[test]
    fn test_sources_are_found() {
        assert!(
            production_lines().len() > 100,
            "production sources not found under {}",
            workspace_root().display()
        );
    }
}
