//! Spindle Context - Budget tracking and injection planning.
//!
//! Two halves, tightly coupled:
//!
//! - [`ContextBudget`]: per-session token usage tracking, pressure
//!   classification, compaction requests, and the *compaction gate*: once
//!   usage crosses the hard limit, every tool call except `session_compact`
//!   is rejected until a compaction lands.
//! - [`InjectionPlanner`]: assembles the hidden context block injected
//!   before each agent turn (truth facts, task state, tape anchor,
//!   viewport hints, skill candidates, ledger digest) under per-source
//!   token caps, with per-scope fingerprint deduplication so parallel
//!   branches of a session never double-inject.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod budget;
mod planner;

pub use budget::{
    CompactionDecision, ContextBudget, ContextBudgetConfig, ContextPressure, ContextUsage,
    GateBlocked, InjectionPlan, TruncationStrategy, classify_pressure, scope_key,
};
pub use planner::{InjectionOutcome, InjectionPlanner, PlanInput, PlannerConfig};
