//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the orchestrator core and CLI MUST NOT call
//! sleep methods. Timeouts use `tokio::time::timeout`, periodic work uses
//! `tokio::time::interval`, and waiting happens on I/O or channels.
//! **Exceptions**: test code.

use architectural_enforcement::{code_part, production_sources};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            if code.contains("::sleep(") || code.contains(".sleep(") {
                violations.push(file.describe(idx, "Sleep call"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::timeout() around the awaited I/O");
        eprintln!("  - tokio::time::interval() for periodic tasks");
        eprintln!("  - watch / mpsc channels to wait for events");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
