//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Timers are
//! deadlines (`sleep_until`) or intervals polled inside a `select!`, so every
//! wait can be interrupted by a command or an I/O event.
//! **Exceptions**: test code (after `#[cfg(test)]`).

use architectural_enforcement::{production_lines, rust_files, workspace_root, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse a deadline (sleep_until) or an interval inside select! instead.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_sleep_violations() -> Vec<String> {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for path in rust_files(&root.join(dir)) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (line_number, code) in production_lines(&content) {
                if is_sleep_call(code) {
                    violations.push(format!("{}:{line_number} - {}", path.display(), code.trim()));
                }
            }
        }
    }

    violations
}

fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(") || code.starts_with("sleep(")
}

#[test]
fn test_sleep_detection() {
    assert!(is_sleep_call("    tokio::time::sleep(Duration::from_millis(10)).await;"));
    assert!(is_sleep_call("std::thread::sleep(delay);"));
    assert!(!is_sleep_call("() = sleep_until(deadline) => {}"));
    assert!(!is_sleep_call("interval.tick().await;"));
}
