//! Spindle Verify - Verification checks and blocker synchronization.
//!
//! The gate tracks, per session: the last mutation time, classified
//! evidence from tool results, cached check runs, and which checks are
//! currently synced as blockers. `verify_completion` runs missing or
//! stale checks synchronously against the workspace (with a hard
//! timeout), caches the results, and re-evaluates. Failing checks become
//! `verifier:<check>` blocker actions (and matching truth facts) for the
//! orchestrator to write into the event log; a previously failing check
//! that now passes resolves both.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod gate;
mod runner;

pub use gate::{
    BlockerSyncAction, CheckRun, CheckStatus, Evaluation, EvidenceKind, EvidenceRecord,
    VerificationGate, VerifyConfig, VerifyLevel,
};
pub use runner::{CheckOutcome, run_check};
