//! Minimal line diff for patch records.
//!
//! The diff trims the common prefix and suffix and renders the middle as
//! one `-`/`+` hunk. Good enough for a human reading the patch history;
//! rollback works from captured bytes, never from the diff.

/// Size cap above which no diff is rendered.
const MAX_DIFF_INPUT_BYTES: usize = 64 * 1024;

/// Render a compact unified-style diff between two text contents.
///
/// Returns `None` for binary-looking or oversized inputs, or when the
/// contents are identical.
#[must_use]
pub fn unified_diff(path: &str, before: &[u8], after: &[u8]) -> Option<String> {
    if before == after {
        return None;
    }
    if before.len() > MAX_DIFF_INPUT_BYTES || after.len() > MAX_DIFF_INPUT_BYTES {
        return None;
    }
    let before = std::str::from_utf8(before).ok()?;
    let after = std::str::from_utf8(after).ok()?;

    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();

    let common_prefix = before_lines
        .iter()
        .zip(&after_lines)
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = before_lines.len().min(after_lines.len()) - common_prefix;
    let common_suffix = (0..max_suffix)
        .take_while(|i| {
            before_lines[before_lines.len() - 1 - i] == after_lines[after_lines.len() - 1 - i]
        })
        .count();

    let mut out = String::new();
    out.push_str(&format!(
        "--- {path}\n+++ {path}\n@@ line {} @@\n",
        common_prefix + 1
    ));
    for line in &before_lines[common_prefix..before_lines.len() - common_suffix] {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &after_lines[common_prefix..after_lines.len() - common_suffix] {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_yields_none() {
        assert!(unified_diff("a.rs", b"same\n", b"same\n").is_none());
    }

    #[test]
    fn test_single_line_change() {
        let diff = unified_diff("a.rs", b"one\ntwo\nthree\n", b"one\n2\nthree\n").unwrap();
        assert!(diff.contains("-two"));
        assert!(diff.contains("+2"));
        assert!(!diff.contains("-one"));
        assert!(!diff.contains("-three"));
    }

    #[test]
    fn test_binary_yields_none() {
        assert!(unified_diff("a.bin", &[0u8, 159, 146, 150], b"text").is_none());
    }

    #[test]
    fn test_pure_addition() {
        let diff = unified_diff("a.rs", b"one\n", b"one\ntwo\n").unwrap();
        assert!(diff.contains("+two"));
        assert!(!diff.contains("-one"));
    }
}
