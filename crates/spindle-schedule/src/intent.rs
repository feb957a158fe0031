//! Intent types and the projection fold.

use serde::{Deserialize, Serialize};
use spindle_core::{IntentId, SessionId, TimestampMs};
use spindle_replay::{SessionProjection, TaskPhase};

/// Canonical schema for intent event payloads.
pub const SCHEDULE_SCHEMA: &str = "spindle.schedule.v1";
/// Canonical schema for the projection snapshot file.
pub const SCHEDULE_PROJECTION_SCHEMA: &str = "spindle.schedule.projection.v1";

/// Whether a child session inherits the parent's task/truth context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuityMode {
    /// The child starts from the parent's task spec and truth facts.
    #[default]
    Inherit,
    /// The child starts clean.
    Fresh,
}

impl ContinuityMode {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::Fresh => "fresh",
        }
    }
}

/// Intent lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Armed (or dormant awaiting a new `nextRunAt`).
    #[default]
    Active,
    /// Cancelled by the owner or by the error circuit.
    Cancelled,
    /// The convergence condition (or run cap) was met.
    Converged,
    /// The executor failed and backoff is in force.
    Error,
}

/// The condition that terminates a recurring intent, evaluated against
/// the child session's post-run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConvergenceCondition {
    /// A truth fact has been resolved.
    TruthResolved {
        /// The fact to watch.
        fact_id: String,
    },
    /// The task reached a phase (single-phase equality).
    TaskPhase {
        /// The phase to reach.
        phase: TaskPhase,
    },
    /// A run-count cap.
    MaxRuns {
        /// The cap.
        limit: u32,
    },
    /// All sub-conditions hold.
    AllOf {
        /// The sub-conditions.
        conditions: Vec<ConvergenceCondition>,
    },
    /// Any sub-condition holds.
    AnyOf {
        /// The sub-conditions.
        conditions: Vec<ConvergenceCondition>,
    },
}

impl ConvergenceCondition {
    /// Evaluate against the child session's post-run projection.
    #[must_use]
    pub fn evaluate(&self, projection: &SessionProjection, run_count: u32) -> bool {
        match self {
            Self::TruthResolved { fact_id } => projection.truth.is_resolved(fact_id),
            Self::TaskPhase { phase } => projection.task.status.phase == *phase,
            Self::MaxRuns { limit } => run_count >= *limit,
            Self::AllOf { conditions } => conditions
                .iter()
                .all(|c| c.evaluate(projection, run_count)),
            Self::AnyOf { conditions } => conditions
                .iter()
                .any(|c| c.evaluate(projection, run_count)),
        }
    }
}

/// The projected state of one intent (`spindle.schedule.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleIntent {
    /// Intent id, unique across the workspace.
    pub intent_id: IntentId,
    /// The session that owns the intent.
    pub parent_session_id: SessionId,
    /// Why the intent exists; carried into the wakeup message.
    pub reason: String,
    /// Optional reference to a goal artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_ref: Option<String>,
    /// Child session continuity.
    pub continuity_mode: ContinuityMode,
    /// One-shot fire time. Mutually exclusive with `cron`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<TimestampMs>,
    /// Cron expression. Mutually exclusive with `runAt`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA zone for `cron`; `None` means UTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Run cap; the intent converges at `runCount == maxRuns`.
    pub max_runs: u32,
    /// Completed runs.
    pub run_count: u32,
    /// Next fire instant; `None` when dormant or terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<TimestampMs>,
    /// Lifecycle status.
    pub status: IntentStatus,
    /// Optional convergence predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence_condition: Option<ConvergenceCondition>,
    /// Executor failures since the last success.
    pub consecutive_errors: u32,
    /// Firing lease; at most one fire holds it at a time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_until_ms: Option<TimestampMs>,
    /// Last executor error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// The child session of the last successful run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_evaluation_session_id: Option<SessionId>,
    /// Last state change.
    pub updated_at: TimestampMs,
    /// Event-log position of the last applied event.
    pub event_offset: u64,
}

impl ScheduleIntent {
    /// Whether the intent should hold a timer.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.status == IntentStatus::Active && self.next_run_at.is_some()
    }

    /// The run index the next fire would carry.
    #[must_use]
    pub fn next_run_index(&self) -> u32 {
        self.run_count + 1
    }
}

/// Input to `createIntent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentInput {
    /// Intent id; must be unique.
    pub intent_id: IntentId,
    /// Owning session.
    pub parent_session_id: SessionId,
    /// Why the intent exists.
    pub reason: String,
    /// Optional goal reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_ref: Option<String>,
    /// Child session continuity.
    #[serde(default)]
    pub continuity_mode: ContinuityMode,
    /// One-shot fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<TimestampMs>,
    /// Cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// IANA zone for `cron`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Run cap.
    pub max_runs: u32,
    /// Optional convergence predicate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_condition: Option<ConvergenceCondition>,
}

/// Input to `updateIntent`. Absent fields keep their current values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateIntentInput {
    /// The intent to update.
    pub intent_id: IntentId,
    /// The caller; must own the intent.
    pub parent_session_id: SessionId,
    /// New reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// New one-shot fire time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<TimestampMs>,
    /// New cron expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// New time zone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// New run cap; raising it can reactivate a converged intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    /// New convergence predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence_condition: Option<ConvergenceCondition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_replay::fold_truth_event;
    use spindle_events::EventRecord;
    use serde_json::json;

    fn projection_with_resolved_fact(fact_id: &str) -> SessionProjection {
        let mut projection = SessionProjection::default();
        let upsert = EventRecord {
            id: "evt-1".into(),
            session_id: "s1".into(),
            event_type: "truth_ledger:fact_upserted".to_owned(),
            timestamp: 1,
            turn: None,
            payload: Some(json!({"id": fact_id, "kind": "note", "summary": "x"})),
        };
        let resolve = EventRecord {
            id: "evt-2".into(),
            session_id: "s1".into(),
            event_type: "truth_ledger:fact_resolved".to_owned(),
            timestamp: 2,
            turn: None,
            payload: Some(json!({"id": fact_id})),
        };
        fold_truth_event(&mut projection.truth, &upsert);
        fold_truth_event(&mut projection.truth, &resolve);
        projection
    }

    #[test]
    fn test_truth_resolved_condition() {
        let condition = ConvergenceCondition::TruthResolved {
            fact_id: "f1".to_owned(),
        };
        assert!(condition.evaluate(&projection_with_resolved_fact("f1"), 0));
        assert!(!condition.evaluate(&SessionProjection::default(), 0));
    }

    #[test]
    fn test_task_phase_is_single_phase_equality() {
        let condition = ConvergenceCondition::TaskPhase {
            phase: TaskPhase::Done,
        };
        let mut projection = SessionProjection::default();
        assert!(!condition.evaluate(&projection, 0));
        projection.task.status.phase = TaskPhase::Done;
        assert!(condition.evaluate(&projection, 0));
    }

    #[test]
    fn test_composite_conditions() {
        let all = ConvergenceCondition::AllOf {
            conditions: vec![
                ConvergenceCondition::MaxRuns { limit: 2 },
                ConvergenceCondition::TruthResolved {
                    fact_id: "f1".to_owned(),
                },
            ],
        };
        let projection = projection_with_resolved_fact("f1");
        assert!(!all.evaluate(&projection, 1));
        assert!(all.evaluate(&projection, 2));

        let any = ConvergenceCondition::AnyOf {
            conditions: vec![
                ConvergenceCondition::MaxRuns { limit: 99 },
                ConvergenceCondition::TruthResolved {
                    fact_id: "f1".to_owned(),
                },
            ],
        };
        assert!(any.evaluate(&projection, 0));
    }

    #[test]
    fn test_condition_wire_format() {
        let condition = ConvergenceCondition::AnyOf {
            conditions: vec![ConvergenceCondition::TruthResolved {
                fact_id: "f1".to_owned(),
            }],
        };
        let json = serde_json::to_string(&condition).unwrap();
        assert!(json.contains("\"kind\":\"any_of\""));
        let back: ConvergenceCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, condition);
    }
}
