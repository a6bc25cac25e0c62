//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code waits on I/O, channels, intervals or
//! deadlines. A bare sleep is allowed only where the delay itself is the
//! behavior:
//! - recovery backoff in the session registry
//! - the heartbeat deadline in the SSE parser

use architectural_enforcement::{is_under, production_lines};

const SLEEP_ALLOWED: &[&str] = &[
    "tether/core/src/registry/session.rs",
    "tether/core/src/sse/parser.rs",
];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for line in production_lines() {
        let code = line.code.as_str();

        if code.contains("thread::sleep") {
            violations.push(format!("{} - thread sleep: {}", line.location(), code.trim()));
            continue;
        }
        let sleeps = code.contains("time::sleep") || code.contains("sleep_until(");
        if sleeps && !SLEEP_ALLOWED.iter().any(|allowed| is_under(&line.path, allowed)) {
            violations.push(format!("{} - sleep: {}", line.location(), code.trim()));
        }
    }

    if !violations.is_empty() {
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        eprintln!("\n✅ Use tokio::time::interval, timeout_at or a channel instead");
        panic!("\nFound {} sleep violation(s) in production code.", violations.len());
    }
}
