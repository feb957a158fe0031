//! Spindle WAL - Idempotent record of in-flight externally-triggered turns.
//!
//! A turn arriving from outside (channel message, scheduled wakeup,
//! gateway call, heartbeat) is recorded here *before* it is executed, so
//! a crash mid-turn is recoverable: on startup, pending records are
//! retried up to a cap, and inflight records older than their TTL are
//! expired. Records transition monotonically from pending through
//! inflight to one of done, failed, or expired; terminal states are
//! sticky. Appends are idempotent on `dedupeKey`.
//!
//! Layout: one JSON file per record under `.spindle/turn-wal/<source>/`
//! (`spindle.turn-wal.v1`).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod record;
mod store;

pub use record::{TURN_WAL_SCHEMA, TurnEnvelope, TurnSource, TurnWalRecord, WalStatus};
pub use store::{AppendOptions, RecoveryReport, TurnWal, WalConfig, WalError, WalResult};
