//! The event record wire format.

use serde::{Deserialize, Serialize};
use spindle_core::{EventId, SessionId, TimestampMs};

/// Canonical schema name embedded in payloads that carry one.
pub const EVENT_SCHEMA: &str = "spindle.event.v1";

/// One record in a session's append-only log.
///
/// Records are append-only, per-session-ordered, and never mutated. The
/// `type` tag is free-form; its category is inferred from the prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Opaque unique id, monotone within the session.
    pub id: EventId,
    /// Owning session.
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    /// Free-form type tag with a conventional prefix.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: TimestampMs,
    /// Monotonic turn counter within the session, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    /// Structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EventRecord {
    /// Category inferred from the type prefix.
    #[must_use]
    pub fn category(&self) -> EventCategory {
        EventCategory::of(&self.event_type)
    }
}

/// Conventional event categories, inferred from the `type` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// `task_ledger:*`: folded into `TaskState`.
    TaskLedger,
    /// `truth_ledger:*`: folded into `TruthState`.
    TruthLedger,
    /// `tape_anchor`: a named handoff point.
    TapeAnchor,
    /// `tape_checkpoint`: compacted full-state snapshot.
    TapeCheckpoint,
    /// `schedule_intent:*`: scheduler lifecycle.
    ScheduleIntent,
    /// `schedule_*`: other scheduler events (wakeups, recovery).
    Schedule,
    /// `tool_*`: tool-call lifecycle.
    Tool,
    /// `context_*`: budget and injection events.
    Context,
    /// `cost_*`: spend accounting.
    Cost,
    /// `verification_*`: check runs and evaluation.
    Verification,
    /// `patch_*`: file-change history.
    Patch,
    /// `ledger_*`: evidence ledger maintenance.
    Ledger,
    /// `session_*`: session lifecycle.
    Session,
    /// `message_*`: agent output health updates.
    Message,
    /// Anything else.
    Other,
}

impl EventCategory {
    /// Classify a type tag.
    #[must_use]
    pub fn of(event_type: &str) -> Self {
        if event_type.starts_with("task_ledger") {
            Self::TaskLedger
        } else if event_type.starts_with("truth_ledger") {
            Self::TruthLedger
        } else if event_type == "tape_anchor" {
            Self::TapeAnchor
        } else if event_type == "tape_checkpoint" {
            Self::TapeCheckpoint
        } else if event_type.starts_with("schedule_intent") {
            Self::ScheduleIntent
        } else if event_type.starts_with("schedule_") {
            Self::Schedule
        } else if event_type.starts_with("tool_") {
            Self::Tool
        } else if event_type.starts_with("context_") {
            Self::Context
        } else if event_type.starts_with("cost_") {
            Self::Cost
        } else if event_type.starts_with("verification_") {
            Self::Verification
        } else if event_type.starts_with("patch_") {
            Self::Patch
        } else if event_type.starts_with("ledger_") {
            Self::Ledger
        } else if event_type.starts_with("session_") {
            Self::Session
        } else if event_type.starts_with("message_") {
            Self::Message
        } else {
            Self::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_inference() {
        assert_eq!(
            EventCategory::of("task_ledger:status_set"),
            EventCategory::TaskLedger
        );
        assert_eq!(EventCategory::of("tape_anchor"), EventCategory::TapeAnchor);
        assert_eq!(
            EventCategory::of("schedule_intent:intent_fired"),
            EventCategory::ScheduleIntent
        );
        assert_eq!(
            EventCategory::of("schedule_wakeup"),
            EventCategory::Schedule
        );
        assert_eq!(EventCategory::of("tool_call_blocked"), EventCategory::Tool);
        assert_eq!(EventCategory::of("mystery"), EventCategory::Other);
    }

    #[test]
    fn test_wire_format() {
        let record = EventRecord {
            id: "evt-00000001".into(),
            session_id: "s1".into(),
            event_type: "session_started".to_owned(),
            timestamp: 1_700_000_000_000,
            turn: None,
            payload: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sessionId\":\"s1\""));
        assert!(json.contains("\"type\":\"session_started\""));
        // Absent optionals are omitted from the wire.
        assert!(!json.contains("turn"));
        assert!(!json.contains("payload"));
    }
}
