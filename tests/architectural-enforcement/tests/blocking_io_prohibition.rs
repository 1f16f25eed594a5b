//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async functions in the orchestrator core and CLI MUST NOT use
//! blocking I/O. Probes and dispatches run concurrently on the runtime; one
//! blocked worker thread stalls every request scheduled on it.
//! **Acceptable**: non-async functions (configuration loading before the
//! fleet is touched) and test code.

use architectural_enforcement::{code_part, enclosing_fn, production_sources, Enclosing};

/// Patterns that block the calling thread
const BLOCKING: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::thread::sleep", "Thread sleep"),
    ("std::io::stdin()", "Blocking stdin"),
];

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            let code = code_part(line);
            for (pattern, what) in BLOCKING {
                if code.contains(pattern) && enclosing_fn(&file.lines, idx) == Enclosing::Async {
                    violations.push(file.describe(idx, what));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in async production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await");
        eprintln!("  - reqwest::Client (async)");
        eprintln!("  - tokio::process::Command::output().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Backend calls must go through the async client
#[test]
fn test_backend_uses_async_http_client() {
    let sources = production_sources();
    let backend: Vec<_> = sources
        .iter()
        .filter(|f| f.path.to_string_lossy().contains("backend"))
        .collect();
    assert!(!backend.is_empty(), "backend sources not found");

    for file in backend {
        for (idx, line) in file.lines.iter().enumerate() {
            assert!(
                !code_part(line).contains("reqwest::blocking"),
                "{}",
                file.describe(idx, "Blocking HTTP client")
            );
        }
    }
}
