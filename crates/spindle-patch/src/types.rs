//! Patch set types.

use serde::{Deserialize, Serialize};
use spindle_core::{ContentHash, PatchSetId, TimestampMs, ToolCallId};

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchAction {
    /// Absent before, present after.
    Add,
    /// Present before and after, content changed.
    Modify,
    /// Present before, absent after.
    Delete,
}

/// One file's delta within a patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFileChange {
    /// Workspace-relative path.
    pub path: String,
    /// Derived from before/after existence.
    pub action: PatchAction,
    /// Hash of the content before the call (zero when absent).
    pub before_hash: ContentHash,
    /// Hash of the content after the call (zero when absent).
    pub after_hash: ContentHash,
    /// Unified line diff, when recorded and the file is text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_text: Option<String>,
}

/// The delta produced by one successful mutation tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSet {
    /// Monotone within the session.
    pub id: PatchSetId,
    /// When the patch set was recorded.
    pub created_at: TimestampMs,
    /// The tool call that produced it.
    pub tool_call_id: ToolCallId,
    /// The mutation tool's name.
    pub tool_name: String,
    /// Per-file deltas; unchanged files are omitted.
    pub changes: Vec<PatchFileChange>,
}

/// Outcome of rolling back the newest patch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    /// The rolled-back patch set.
    pub patch_set_id: PatchSetId,
    /// Files restored to their before-content.
    pub restored_paths: Vec<String>,
    /// Files that could not be restored.
    pub failed_paths: Vec<String>,
}

impl RollbackResult {
    /// Whether every file was restored.
    #[must_use]
    pub fn fully_restored(&self) -> bool {
        self.failed_paths.is_empty()
    }
}
