//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: Production code MUST NOT call `unwrap()` or `expect()`. A
//! dropped connection or a bad frame is an expected event for a long-lived
//! link, so failures are returned or logged, never turned into panics.
//! **Exceptions**: test code (after `#[cfg(test)]`).

use architectural_enforcement::{production_lines, rust_files, workspace_root, PRODUCTION_DIRS};

#[test]
fn test_no_unwrap_in_production_code() {
    let root = workspace_root();
    let mut violations = Vec::new();

    for dir in PRODUCTION_DIRS {
        for path in rust_files(&root.join(dir)) {
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (line_number, code) in production_lines(&content) {
                if is_panicking_unwrap(code) {
                    violations.push(format!("{}:{line_number} - {}", path.display(), code.trim()));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\nunwrap()/expect() found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        panic!(
            "\nFound {} unwrap violation(s) in production code.",
            violations.len()
        );
    }
}

fn is_panicking_unwrap(code: &str) -> bool {
    code.contains(".unwrap()") || code.contains(".expect(")
}

#[test]
fn test_unwrap_detection() {
    assert!(is_panicking_unwrap("let x = value.unwrap();"));
    assert!(is_panicking_unwrap("let x = value.expect(\"present\");"));
    assert!(!is_panicking_unwrap("let x = value.unwrap_or_default();"));
    assert!(!is_panicking_unwrap("let x = value.unwrap_or_else(|| 0);"));
}
