//! Tape status: a window over the event log.
//!
//! An *anchor* is an explicit handoff point (`tape_anchor`) with a name,
//! summary, and next steps. A *checkpoint* (`tape_checkpoint`) is a
//! compacted dump of the full task+truth state. Tape pressure is an
//! ordinal severity derived from how many events have accumulated since
//! the last anchor.

use serde::{Deserialize, Serialize};
use spindle_core::{EventId, TimestampMs};
use spindle_events::EventRecord;

/// Ordinal severity over entries-since-anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapePressure {
    /// Below every threshold.
    None,
    /// At or above the low threshold.
    Low,
    /// At or above the medium threshold.
    Medium,
    /// At or above the high threshold.
    High,
}

/// Thresholds over entries-since-anchor.
#[derive(Debug, Clone, Copy)]
pub struct TapeThresholds {
    /// At or above: at least `Low`.
    pub low: u64,
    /// At or above: at least `Medium`.
    pub medium: u64,
    /// At or above: `High`.
    pub high: u64,
}

/// The last anchor's payload plus position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorInfo {
    /// Anchor name.
    pub name: String,
    /// Handoff summary.
    pub summary: String,
    /// Next steps, verbatim from the payload.
    pub next_steps: String,
    /// Turn the anchor was recorded on, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<u64>,
    /// When the anchor was recorded.
    pub timestamp: TimestampMs,
}

/// Window statistics over a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapeStatus {
    /// Total records in the session.
    pub total_entries: u64,
    /// Records since the last anchor (or since birth).
    pub entries_since_anchor: u64,
    /// Records since the last checkpoint (or since birth).
    pub entries_since_checkpoint: u64,
    /// Pressure classification.
    pub tape_pressure: TapePressure,
    /// The last anchor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_anchor: Option<AnchorInfo>,
    /// The last checkpoint's event id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<EventId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnchorPayload {
    name: String,
    summary: String,
    #[serde(default)]
    next_steps: String,
}

/// Classify pressure from entries-since-anchor.
#[must_use]
pub fn classify_pressure(entries_since_anchor: u64, thresholds: &TapeThresholds) -> TapePressure {
    if entries_since_anchor >= thresholds.high {
        TapePressure::High
    } else if entries_since_anchor >= thresholds.medium {
        TapePressure::Medium
    } else if entries_since_anchor >= thresholds.low {
        TapePressure::Low
    } else {
        TapePressure::None
    }
}

/// Compute the tape status for a session's full event stream.
#[must_use]
pub fn compute_tape_status(records: &[EventRecord], thresholds: &TapeThresholds) -> TapeStatus {
    let mut last_anchor: Option<AnchorInfo> = None;
    let mut last_anchor_index: Option<usize> = None;
    let mut last_checkpoint_id: Option<EventId> = None;
    let mut last_checkpoint_index: Option<usize> = None;

    for (index, record) in records.iter().enumerate() {
        match record.event_type.as_str() {
            "tape_anchor" => {
                if let Some(payload) = record.payload.as_ref()
                    && let Ok(anchor) =
                        serde_json::from_value::<AnchorPayload>(payload.clone())
                {
                    last_anchor = Some(AnchorInfo {
                        name: anchor.name,
                        summary: anchor.summary,
                        next_steps: anchor.next_steps,
                        turn: record.turn,
                        timestamp: record.timestamp,
                    });
                    last_anchor_index = Some(index);
                }
            },
            "tape_checkpoint" => {
                last_checkpoint_id = Some(record.id.clone());
                last_checkpoint_index = Some(index);
            },
            _ => {},
        }
    }

    let total = records.len() as u64;
    let since = |marker: Option<usize>| -> u64 {
        marker.map_or(total, |index| (records.len() - index - 1) as u64)
    };

    let entries_since_anchor = since(last_anchor_index);
    TapeStatus {
        total_entries: total,
        entries_since_anchor,
        entries_since_checkpoint: since(last_checkpoint_index),
        tape_pressure: classify_pressure(entries_since_anchor, thresholds),
        last_anchor,
        last_checkpoint_id,
    }
}
