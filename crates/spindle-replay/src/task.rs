//! Task state and its fold.

use serde::{Deserialize, Serialize};
use spindle_events::EventRecord;
use tracing::warn;

/// The task specification set by the agent (or a collaborator) via
/// `task_ledger:spec_set`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskSpec {
    /// What the task is trying to achieve.
    pub goal: String,
    /// Files the task intends to touch.
    pub target_files: Vec<String>,
    /// Symbols the task intends to touch.
    pub target_symbols: Vec<String>,
    /// Constraints the work must respect.
    pub constraints: Vec<String>,
    /// Verification level requested at completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_level: Option<String>,
}

/// Task lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Agreeing on what to do.
    #[default]
    Align,
    /// Reading before writing.
    Investigate,
    /// Making changes.
    Execute,
    /// Running checks.
    Verify,
    /// Stuck on a blocker.
    Blocked,
    /// Finished.
    Done,
}

impl TaskPhase {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Align => "align",
            Self::Investigate => "investigate",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }
}

/// Task health, orthogonal to phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHealth {
    /// All good.
    Ok,
    /// No spec yet.
    NeedsSpec,
    /// At least one open blocker.
    Blocked,
    /// A verification check is failing.
    VerificationFailed,
    /// Context or cost budget under pressure.
    BudgetPressure,
    /// Not enough signal to say.
    #[default]
    Unknown,
}

/// Current status block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskStatus {
    /// Lifecycle phase.
    pub phase: TaskPhase,
    /// Health signal.
    pub health: TaskHealth,
    /// Why, when phase/health are not self-explanatory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Truth facts backing this status.
    pub truth_fact_ids: Vec<String>,
}

/// State of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Not started.
    Todo,
    /// In progress.
    Doing,
    /// Finished.
    Done,
    /// Stuck.
    Blocked,
}

/// One ordered work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    /// Stable id.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Item state.
    pub state: ItemState,
}

/// One blocker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBlocker {
    /// Stable id; a duplicate id replaces in place.
    pub id: String,
    /// What is blocking.
    pub message: String,
    /// Who reported it (e.g. `verifier:type-check`, `user`).
    pub source: String,
    /// Backing truth fact, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truth_fact_id: Option<String>,
}

/// The folded task state for a session.
///
/// Items keep creation order; a duplicate blocker id replaces in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskState {
    /// Spec, once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<TaskSpec>,
    /// Status block.
    pub status: TaskStatus,
    /// Ordered work items.
    pub items: Vec<TaskItem>,
    /// Open and historical blockers (resolved ones are removed).
    pub blockers: Vec<TaskBlocker>,
}

impl TaskState {
    /// Open items (todo or doing).
    #[must_use]
    pub fn open_items(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.state, ItemState::Todo | ItemState::Doing))
            .count()
    }
}

/// Apply one `task_ledger:*` event to the state.
///
/// Unknown operations and malformed payloads are skipped with a warning;
/// the fold is total.
pub fn fold_task_event(state: &mut TaskState, record: &EventRecord) {
    let Some(payload) = record.payload.as_ref() else {
        return;
    };

    match record.event_type.as_str() {
        "task_ledger:spec_set" => {
            match serde_json::from_value::<TaskSpec>(payload.clone()) {
                Ok(spec) => state.spec = Some(spec),
                Err(err) => warn!(event = %record.id, error = %err, "bad spec_set payload"),
            }
        },
        "task_ledger:status_set" => {
            match serde_json::from_value::<TaskStatus>(payload.clone()) {
                Ok(status) => state.status = status,
                Err(err) => warn!(event = %record.id, error = %err, "bad status_set payload"),
            }
        },
        "task_ledger:item_upserted" => {
            match serde_json::from_value::<TaskItem>(payload.clone()) {
                Ok(item) => {
                    if let Some(existing) =
                        state.items.iter_mut().find(|i| i.id == item.id)
                    {
                        *existing = item;
                    } else {
                        state.items.push(item);
                    }
                },
                Err(err) => warn!(event = %record.id, error = %err, "bad item payload"),
            }
        },
        "task_ledger:blocker_added" => {
            match serde_json::from_value::<TaskBlocker>(payload.clone()) {
                Ok(blocker) => {
                    if let Some(existing) =
                        state.blockers.iter_mut().find(|b| b.id == blocker.id)
                    {
                        *existing = blocker;
                    } else {
                        state.blockers.push(blocker);
                    }
                },
                Err(err) => warn!(event = %record.id, error = %err, "bad blocker payload"),
            }
        },
        "task_ledger:blocker_resolved" => {
            if let Some(id) = payload.get("id").and_then(serde_json::Value::as_str) {
                state.blockers.retain(|b| b.id != id);
            }
        },
        other => {
            warn!(event_type = other, "unknown task_ledger operation skipped");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(event_type: &str, payload: serde_json::Value) -> EventRecord {
        EventRecord {
            id: "evt-1".into(),
            session_id: "s1".into(),
            event_type: event_type.to_owned(),
            timestamp: 0,
            turn: None,
            payload: Some(payload),
        }
    }

    #[test]
    fn test_spec_and_status() {
        let mut state = TaskState::default();
        fold_task_event(
            &mut state,
            &record("task_ledger:spec_set", json!({"goal": "fix the parser"})),
        );
        fold_task_event(
            &mut state,
            &record(
                "task_ledger:status_set",
                json!({"phase": "execute", "health": "ok"}),
            ),
        );
        assert_eq!(state.spec.as_ref().unwrap().goal, "fix the parser");
        assert_eq!(state.status.phase, TaskPhase::Execute);
        assert_eq!(state.status.health, TaskHealth::Ok);
    }

    #[test]
    fn test_items_keep_creation_order() {
        let mut state = TaskState::default();
        for (id, title) in [("a", "first"), ("b", "second"), ("c", "third")] {
            fold_task_event(
                &mut state,
                &record(
                    "task_ledger:item_upserted",
                    json!({"id": id, "title": title, "state": "todo"}),
                ),
            );
        }
        // Upserting an existing id updates in place without reordering.
        fold_task_event(
            &mut state,
            &record(
                "task_ledger:item_upserted",
                json!({"id": "a", "title": "first", "state": "done"}),
            ),
        );
        let ids: Vec<&str> = state.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(state.items[0].state, ItemState::Done);
        assert_eq!(state.open_items(), 2);
    }

    #[test]
    fn test_duplicate_blocker_replaces_in_place() {
        let mut state = TaskState::default();
        fold_task_event(
            &mut state,
            &record(
                "task_ledger:blocker_added",
                json!({"id": "verifier:type-check", "message": "2 errors", "source": "verifier"}),
            ),
        );
        fold_task_event(
            &mut state,
            &record(
                "task_ledger:blocker_added",
                json!({"id": "verifier:type-check", "message": "1 error", "source": "verifier"}),
            ),
        );
        assert_eq!(state.blockers.len(), 1);
        assert_eq!(state.blockers[0].message, "1 error");

        fold_task_event(
            &mut state,
            &record("task_ledger:blocker_resolved", json!({"id": "verifier:type-check"})),
        );
        assert!(state.blockers.is_empty());
    }

    #[test]
    fn test_malformed_payload_is_skipped() {
        let mut state = TaskState::default();
        fold_task_event(
            &mut state,
            &record("task_ledger:status_set", json!({"phase": "nonsense"})),
        );
        assert_eq!(state.status.phase, TaskPhase::Align);
    }
}
