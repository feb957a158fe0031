//! Shell check execution with a hard timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

/// Cap on the stored output summary.
const SUMMARY_LIMIT: usize = 400;

/// Outcome of one check command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Whether the command exited zero.
    pub ok: bool,
    /// Exit code, when the process ran to completion.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// True when the hard timeout expired.
    pub timed_out: bool,
    /// Trailing slice of combined stdout/stderr.
    pub output_summary: String,
}

/// Run a check command in the workspace with a hard timeout.
///
/// The command runs under `sh -c`; on timeout the child is killed and the
/// run is marked failed with `timed_out = true`.
pub async fn run_check(workspace_root: &Path, command: &str, timeout_ms: u64) -> CheckOutcome {
    let started = Instant::now();
    debug!(command, "running verification check");

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(Duration::from_millis(timeout_ms), spawned).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            CheckOutcome {
                ok: output.status.success(),
                exit_code: output.status.code(),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
                output_summary: tail(&combined, SUMMARY_LIMIT),
            }
        },
        Ok(Err(err)) => {
            warn!(command, error = %err, "check failed to spawn");
            CheckOutcome {
                ok: false,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
                output_summary: format!("spawn failed: {err}"),
            }
        },
        Err(_) => {
            warn!(command, timeout_ms, "check timed out");
            CheckOutcome {
                ok: false,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
                output_summary: format!("timed out after {timeout_ms}ms"),
            }
        },
    }
}

fn tail(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= limit {
        return trimmed.to_owned();
    }
    chars[chars.len() - limit..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passing_command() {
        let dir = std::env::temp_dir();
        let outcome = run_check(&dir, "true", 5_000).await;
        assert!(outcome.ok);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_failing_command_keeps_exit_code() {
        let dir = std::env::temp_dir();
        let outcome = run_check(&dir, "exit 2", 5_000).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out() {
        let dir = std::env::temp_dir();
        let outcome = run_check(&dir, "sleep 5", 100).await;
        assert!(!outcome.ok);
        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_output_summary_captured() {
        let dir = std::env::temp_dir();
        let outcome = run_check(&dir, "echo hello-from-check", 5_000).await;
        assert!(outcome.output_summary.contains("hello-from-check"));
    }
}
