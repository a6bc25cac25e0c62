//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Production code MUST NOT block the runtime.
//! **Required**: `tokio::fs`, `tokio::net`, async `reqwest`.
//! **Exception**: configuration loading in `config/`, which runs before any
//! stream or queue exists.

use architectural_enforcement::{is_under, production_lines, SourceLine};

fn violation(line: &SourceLine, what: &str) -> String {
    format!("{} - {what}: {}", line.location(), line.code.trim())
}

#[test]
fn test_no_blocking_io_in_production_code() {
    let mut violations = Vec::new();

    for line in production_lines() {
        let code = line.code.as_str();

        if code.contains("std::fs") && !is_under(&line.path, "tether/core/src/config") {
            violations.push(violation(&line, "Blocking file I/O"));
        }
        if code.contains("std::net::") || code.contains("use std::net") {
            violations.push(violation(&line, "Blocking network I/O"));
        }
        if code.contains("reqwest::blocking") {
            violations.push(violation(&line, "Blocking HTTP client"));
        }
        if code.contains("std::process::Command") {
            violations.push(violation(&line, "Blocking process I/O"));
        }
        if code.contains("block_on(") {
            violations.push(violation(&line, "Nested runtime"));
        }
    }

    if !violations.is_empty() {
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}
