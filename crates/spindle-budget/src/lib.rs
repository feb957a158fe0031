//! Spindle Budget - Cost accounting and parallel admission.
//!
//! Two layers of resource control:
//! - [`CostTracker`]: per-turn token/USD accounting with a session cap and
//!   an alert threshold. Once the cap is hit the session is blocked and
//!   the tool gate rejects further calls.
//! - [`ParallelBudget`]: admission control for parallel worker slots, per
//!   session and per skill. Releases are idempotent.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cost;
mod parallel;

pub use cost::{CostAlert, CostConfig, CostOutcome, CostSnapshot, CostTracker};
pub use parallel::{ParallelBudget, ParallelConfig, ParallelError, ParallelResult};
