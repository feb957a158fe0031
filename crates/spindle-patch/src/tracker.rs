//! The file-change tracker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use spindle_core::{ContentHash, ErrorCode, PatchSetId, SessionId, ToolCallId, now_ms};

use crate::diff::unified_diff;
use crate::types::{PatchAction, PatchFileChange, PatchSet, RollbackResult};

/// Argument keys inspected for file paths.
const PATH_KEYS: &[&str] = &["file_path", "path", "old_path", "new_path"];

/// Errors raised by the tracker.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Rollback was requested with no patch set on the session's history.
    #[error("no patch set recorded for session {0}")]
    NoPatchSet(SessionId),
}

impl ErrorCode for PatchError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoPatchSet(_) => "state_no_patchset",
        }
    }
}

/// Result type for tracker operations.
pub type PatchResult<T> = Result<T, PatchError>;

/// What a capture found.
#[derive(Debug, Clone, Default)]
pub struct CaptureOutcome {
    /// Workspace-relative paths snapshotted before the call.
    pub tracked_paths: Vec<String>,
}

impl CaptureOutcome {
    /// Whether any file was tracked.
    #[must_use]
    pub fn tracked_any(&self) -> bool {
        !self.tracked_paths.is_empty()
    }
}

struct Snapshot {
    relative: String,
    absolute: PathBuf,
    hash: ContentHash,
    /// `None` means the file was absent.
    content: Option<Vec<u8>>,
}

struct PendingCapture {
    session_id: SessionId,
    tool_name: String,
    snapshots: Vec<Snapshot>,
}

struct StoredPatchSet {
    patch: PatchSet,
    /// Before-content per path, for rollback. `None` means absent.
    before: HashMap<String, Option<Vec<u8>>>,
}

struct SessionHistory {
    sets: Vec<StoredPatchSet>,
    next_id: u64,
}

/// Snapshots files around mutation tool calls and keeps per-session patch
/// history for rollback.
pub struct FileChangeTracker {
    workspace_root: PathBuf,
    mutation_tools: Vec<String>,
    record_diff: bool,
    max_history: usize,
    pending: Mutex<HashMap<ToolCallId, PendingCapture>>,
    history: Mutex<HashMap<SessionId, SessionHistory>>,
}

impl FileChangeTracker {
    /// Create a tracker.
    ///
    /// `mutation_tools` are matched case-insensitively against tool names.
    #[must_use]
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        mutation_tools: &[String],
        record_diff: bool,
        max_history: usize,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            mutation_tools: mutation_tools.iter().map(|t| t.to_lowercase()).collect(),
            record_diff,
            max_history: max_history.max(1),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a tool name is classified as a mutation tool.
    #[must_use]
    pub fn is_mutation_tool(&self, tool_name: &str) -> bool {
        self.mutation_tools.contains(&tool_name.to_lowercase())
    }

    /// Snapshot the files a mutation tool call is about to touch.
    ///
    /// Non-mutation tools produce an empty outcome and no pending state.
    pub fn capture_before_tool_call(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        tool_name: &str,
        args: &Value,
    ) -> CaptureOutcome {
        if !self.is_mutation_tool(tool_name) {
            return CaptureOutcome::default();
        }

        let paths = extract_paths(args);
        if paths.is_empty() {
            return CaptureOutcome::default();
        }

        let mut snapshots = Vec::with_capacity(paths.len());
        let mut tracked = Vec::with_capacity(paths.len());
        for relative in paths {
            let absolute = self.workspace_root.join(&relative);
            let (hash, content) = read_snapshot(&absolute);
            tracked.push(relative.clone());
            snapshots.push(Snapshot {
                relative,
                absolute,
                hash,
                content,
            });
        }

        debug!(
            session = %session_id,
            tool = tool_name,
            files = tracked.len(),
            "captured before-snapshots"
        );
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                tool_call_id.clone(),
                PendingCapture {
                    session_id: session_id.clone(),
                    tool_name: tool_name.to_owned(),
                    snapshots,
                },
            );
        CaptureOutcome {
            tracked_paths: tracked,
        }
    }

    /// Close a capture: on success, rescan and record a patch set; on
    /// failure, discard. Returns the patch set when one was recorded.
    pub fn complete_tool_call(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        success: bool,
    ) -> Option<PatchSet> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(tool_call_id)?;

        if !success || &pending.session_id != session_id {
            return None;
        }

        let mut changes = Vec::new();
        let mut before_content = HashMap::new();
        for snapshot in &pending.snapshots {
            let (after_hash, after_content) = read_snapshot(&snapshot.absolute);
            if after_hash == snapshot.hash {
                continue;
            }

            let action = match (snapshot.content.is_some(), after_content.is_some()) {
                (false, true) => PatchAction::Add,
                (true, false) => PatchAction::Delete,
                _ => PatchAction::Modify,
            };
            let diff_text = if self.record_diff {
                unified_diff(
                    &snapshot.relative,
                    snapshot.content.as_deref().unwrap_or(b""),
                    after_content.as_deref().unwrap_or(b""),
                )
            } else {
                None
            };

            before_content.insert(snapshot.relative.clone(), snapshot.content.clone());
            changes.push(PatchFileChange {
                path: snapshot.relative.clone(),
                action,
                before_hash: snapshot.hash,
                after_hash,
                diff_text,
            });
        }

        if changes.is_empty() {
            return None;
        }

        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = history
            .entry(session_id.clone())
            .or_insert_with(|| SessionHistory {
                sets: Vec::new(),
                next_id: 1,
            });

        let patch = PatchSet {
            id: PatchSetId(entry.next_id),
            created_at: now_ms(),
            tool_call_id: tool_call_id.clone(),
            tool_name: pending.tool_name,
            changes,
        };
        entry.next_id += 1;
        entry.sets.push(StoredPatchSet {
            patch: patch.clone(),
            before: before_content,
        });
        if entry.sets.len() > self.max_history {
            entry.sets.remove(0);
        }

        Some(patch)
    }

    /// The session's patch history, oldest first.
    #[must_use]
    pub fn history(&self, session_id: &SessionId) -> Vec<PatchSet> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .map(|h| h.sets.iter().map(|s| s.patch.clone()).collect())
            .unwrap_or_default()
    }

    /// Restore each file of the newest patch set to its before-content.
    ///
    /// Atomicity is best-effort per file; callers that need transactional
    /// rollback must serialize.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::NoPatchSet`] when the session has no history.
    pub fn rollback_last(&self, session_id: &SessionId) -> PatchResult<RollbackResult> {
        let stored = {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            history
                .get_mut(session_id)
                .and_then(|h| h.sets.pop())
                .ok_or_else(|| PatchError::NoPatchSet(session_id.clone()))?
        };

        let mut restored = Vec::new();
        let mut failed = Vec::new();
        for change in &stored.patch.changes {
            let absolute = self.workspace_root.join(&change.path);
            let outcome = match stored.before.get(&change.path) {
                Some(Some(content)) => write_restoring_dirs(&absolute, content),
                // Absent before the call: remove whatever the call created.
                Some(None) | None => match std::fs::remove_file(&absolute) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(err),
                },
            };
            match outcome {
                Ok(()) => restored.push(change.path.clone()),
                Err(err) => {
                    warn!(path = %change.path, error = %err, "rollback failed for file");
                    failed.push(change.path.clone());
                },
            }
        }

        Ok(RollbackResult {
            patch_set_id: stored.patch.id,
            restored_paths: restored,
            failed_paths: failed,
        })
    }

    /// Drop all per-session state (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|_, p| &p.session_id != session_id);
    }
}

impl std::fmt::Debug for FileChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeTracker")
            .field("workspace_root", &self.workspace_root)
            .field("mutation_tools", &self.mutation_tools)
            .finish_non_exhaustive()
    }
}

fn extract_paths(args: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(object) = args.as_object() {
        for key in PATH_KEYS {
            if let Some(value) = object.get(*key).and_then(Value::as_str) {
                paths.push(value.to_owned());
            }
        }
        if let Some(list) = object.get("paths").and_then(Value::as_array) {
            paths.extend(list.iter().filter_map(Value::as_str).map(str::to_owned));
        }
    }
    paths.dedup();
    paths
}

fn read_snapshot(path: &Path) -> (ContentHash, Option<Vec<u8>>) {
    match std::fs::read(path) {
        Ok(content) => (ContentHash::hash(&content), Some(content)),
        // Absent is a sentinel, not an error.
        Err(_) => (ContentHash::zero(), None),
    }
}

fn write_restoring_dirs(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker(root: &Path) -> FileChangeTracker {
        FileChangeTracker::new(
            root,
            &["edit".to_owned(), "write".to_owned()],
            true,
            50,
        )
    }

    #[test]
    fn test_non_mutation_tool_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let outcome = tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "read",
            &json!({"file_path": "a.txt"}),
        );
        assert!(!outcome.tracked_any());
    }

    #[test]
    fn test_modify_records_patch_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v=1").unwrap();
        let tracker = tracker(dir.path());

        let outcome = tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "edit",
            &json!({"file_path": "a.txt"}),
        );
        assert_eq!(outcome.tracked_paths, vec!["a.txt".to_owned()]);

        std::fs::write(dir.path().join("a.txt"), "v=2").unwrap();
        let patch = tracker
            .complete_tool_call(&"s1".into(), &"tc1".into(), true)
            .unwrap();
        assert_eq!(patch.changes.len(), 1);
        assert_eq!(patch.changes[0].action, PatchAction::Modify);
        assert!(patch.changes[0].diff_text.as_ref().unwrap().contains("+v=2"));
    }

    #[test]
    fn test_failed_call_discards_capture() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v=1").unwrap();
        let tracker = tracker(dir.path());

        tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "edit",
            &json!({"file_path": "a.txt"}),
        );
        std::fs::write(dir.path().join("a.txt"), "v=2").unwrap();
        assert!(
            tracker
                .complete_tool_call(&"s1".into(), &"tc1".into(), false)
                .is_none()
        );
        assert!(tracker.history(&"s1".into()).is_empty());
    }

    #[test]
    fn test_unchanged_file_yields_no_patch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v=1").unwrap();
        let tracker = tracker(dir.path());

        tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "edit",
            &json!({"file_path": "a.txt"}),
        );
        assert!(
            tracker
                .complete_tool_call(&"s1".into(), &"tc1".into(), true)
                .is_none()
        );
    }

    #[test]
    fn test_add_and_rollback_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());

        tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "write",
            &json!({"file_path": "new.txt"}),
        );
        std::fs::write(dir.path().join("new.txt"), "created").unwrap();
        let patch = tracker
            .complete_tool_call(&"s1".into(), &"tc1".into(), true)
            .unwrap();
        assert_eq!(patch.changes[0].action, PatchAction::Add);

        let result = tracker.rollback_last(&"s1".into()).unwrap();
        assert!(result.fully_restored());
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_rollback_restores_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "v=1").unwrap();
        let tracker = tracker(dir.path());

        tracker.capture_before_tool_call(
            &"s1".into(),
            &"tc1".into(),
            "edit",
            &json!({"file_path": "a.txt"}),
        );
        std::fs::write(dir.path().join("a.txt"), "v=2").unwrap();
        tracker
            .complete_tool_call(&"s1".into(), &"tc1".into(), true)
            .unwrap();

        let result = tracker.rollback_last(&"s1".into()).unwrap();
        assert_eq!(result.restored_paths, vec!["a.txt".to_owned()]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "v=1"
        );
    }

    #[test]
    fn test_rollback_without_history_errors() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());
        let err = tracker.rollback_last(&"s1".into()).unwrap_err();
        assert_eq!(err.code(), "state_no_patchset");
    }

    #[test]
    fn test_patch_ids_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path());

        for (call, content) in [("tc1", "one"), ("tc2", "two")] {
            tracker.capture_before_tool_call(
                &"s1".into(),
                &call.into(),
                "write",
                &json!({"file_path": "a.txt"}),
            );
            std::fs::write(dir.path().join("a.txt"), content).unwrap();
            tracker.complete_tool_call(&"s1".into(), &call.into(), true);
        }

        let history = tracker.history(&"s1".into());
        assert_eq!(history.len(), 2);
        assert!(history[0].id < history[1].id);
    }
}
