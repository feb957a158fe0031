//! Spindle Replay - Projections over the event log.
//!
//! Task state, truth state, and tape status are pure left-folds over a
//! session's event stream. Nothing in here keeps state that is not
//! re-derivable from events: the event log is the only truth, and any two
//! replays of the same prefix produce identical projections.
//!
//! A `tape_checkpoint` event carries a full task+truth snapshot and
//! *replaces* the working fold state; subsequent events continue to apply
//! on top. The [`ReplayEngine`] memoizes per session, keyed on the head
//! event id.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod engine;
mod tape;
mod task;
mod truth;

pub use engine::{ReplayEngine, SessionProjection};
pub use tape::{AnchorInfo, TapePressure, TapeStatus, TapeThresholds, compute_tape_status};
pub use task::{
    ItemState, TaskBlocker, TaskHealth, TaskItem, TaskPhase, TaskSpec, TaskState, TaskStatus,
    fold_task_event,
};
pub use truth::{FactStatus, Severity, TruthFact, TruthState, fold_truth_event};

/// Canonical schema names for the ledgers folded here.
pub const TASK_LEDGER_SCHEMA: &str = "spindle.task.ledger.v1";
/// Truth ledger schema.
pub const TRUTH_LEDGER_SCHEMA: &str = "spindle.truth.ledger.v1";
