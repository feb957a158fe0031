//! Spindle Schedule - The persistent intent scheduler.
//!
//! An *intent* is a scheduled firing rule owned by a parent session:
//! either a one-shot (`runAt`) or a cron expression in an IANA time zone,
//! with a run cap and an optional convergence predicate evaluated against
//! the child session's post-run state. Intents live in the same event log
//! as everything else (`schedule_intent:*` events on the parent session);
//! the scheduler keeps an in-memory projection with a snapshot file at
//! `.spindle/schedule/projection.json` for fast recovery.
//!
//! Firing is strictly serialized per intent by an in-progress set plus a
//! wall-clock lease, so a retry path or a second scheduler instance can
//! never double-fire a run. Executor failures back off exponentially and
//! open a circuit after a configured error streak. Recovery re-folds the
//! event log, clears stale leases, catches up a bounded number of missed
//! fires round-robin across parent sessions, and defers the rest with
//! spaced `nextRunAt` values.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cron_match;
mod error;
mod intent;
mod scheduler;
mod wakeup;

pub use cron_match::next_cron_match;
pub use error::{ScheduleError, ScheduleResult};
pub use intent::{
    ContinuityMode, ConvergenceCondition, CreateIntentInput, IntentStatus, SCHEDULE_PROJECTION_SCHEMA,
    SCHEDULE_SCHEMA, ScheduleIntent, UpdateIntentInput,
};
pub use scheduler::{
    ExecutionOutcome, ExecutorError, IntentExecutor, RecoveryOutcome, ScheduleConfig, Scheduler,
};
pub use wakeup::build_wakeup_message;
