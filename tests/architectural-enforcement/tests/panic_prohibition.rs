//! Integration Test: Panic Prohibition
//!
//! **Policy**: Library code returns errors. `unwrap()`, `expect()` and
//! `panic!` belong in tests only.

use architectural_enforcement::{is_under, production_lines};

#[test]
fn test_no_unwrap_in_core() {
    let violations: Vec<String> = production_lines()
        .into_iter()
        .filter(|line| is_under(&line.path, "tether/core/src"))
        .filter(|line| {
            let code = line.code.as_str();
            code.contains(".unwrap()") || code.contains(".expect(") || code.contains("panic!(")
        })
        .map(|line| format!("{} - {}", line.location(), line.code.trim()))
        .collect();

    if !violations.is_empty() {
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        panic!("\nFound {} panicking call(s) in tether-core.", violations.len());
    }
}
