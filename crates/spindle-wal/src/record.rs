//! WAL record types.

use serde::{Deserialize, Serialize};
use spindle_core::{SessionId, TimestampMs, TurnId, WalId};

/// Canonical schema name.
pub const TURN_WAL_SCHEMA: &str = "spindle.turn-wal.v1";

/// Where an inbound turn came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    /// A messaging channel adapter.
    Channel,
    /// The scheduler firing an intent.
    Schedule,
    /// The local gateway API.
    Gateway,
    /// A liveness heartbeat.
    Heartbeat,
}

impl TurnSource {
    /// Directory name under `turn-wal/`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Schedule => "schedule",
            Self::Gateway => "gateway",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// WAL record status.
///
/// Transitions are monotonic: pending, then inflight, then one of done,
/// failed, or expired. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    /// Recorded, not yet executing.
    Pending,
    /// Executing.
    Inflight,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// TTL elapsed before a terminal outcome.
    Expired,
}

impl WalStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Expired)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Inflight | Self::Done | Self::Failed | Self::Expired
            ),
            Self::Inflight => matches!(next, Self::Done | Self::Failed | Self::Expired),
            Self::Done | Self::Failed | Self::Expired => false,
        }
    }
}

/// The inbound turn being recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEnvelope {
    /// The turn's id.
    pub turn_id: TurnId,
    /// The session the turn targets.
    pub session_id: SessionId,
    /// Logical channel name (e.g. `"telegram:123"`, `"schedule"`).
    pub channel: String,
    /// The turn content, verbatim.
    pub payload: serde_json::Value,
}

/// One WAL record (`spindle.turn-wal.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnWalRecord {
    /// Schema marker.
    pub schema: String,
    /// Record id; also the file name.
    pub wal_id: WalId,
    /// The turn's id, from the envelope.
    pub turn_id: TurnId,
    /// The session the turn targets.
    pub session_id: SessionId,
    /// Logical channel name.
    pub channel: String,
    /// Source kind; also the directory name.
    pub source: TurnSource,
    /// Current status.
    pub status: WalStatus,
    /// The inbound turn, verbatim.
    pub envelope: TurnEnvelope,
    /// When the record was created.
    pub created_at: TimestampMs,
    /// Last status change.
    pub updated_at: TimestampMs,
    /// Transitions out of `pending` so far.
    pub attempts: u32,
    /// TTL budget for reaching a terminal state.
    pub ttl_ms: i64,
    /// Idempotence key; uniqueness enforced at append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Error recorded by `markFailed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TurnWalRecord {
    /// Whether the record's TTL has elapsed at `now`.
    #[must_use]
    pub fn ttl_elapsed(&self, now: TimestampMs) -> bool {
        now.saturating_sub(self.created_at) > self.ttl_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_matrix() {
        use WalStatus::{Done, Expired, Failed, Inflight, Pending};
        assert!(Pending.can_transition_to(Inflight));
        assert!(Pending.can_transition_to(Expired));
        assert!(Inflight.can_transition_to(Done));
        assert!(Inflight.can_transition_to(Failed));
        assert!(!Inflight.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(Inflight));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WalStatus::Pending.is_terminal());
        assert!(!WalStatus::Inflight.is_terminal());
        assert!(WalStatus::Done.is_terminal());
        assert!(WalStatus::Failed.is_terminal());
        assert!(WalStatus::Expired.is_terminal());
    }
}
