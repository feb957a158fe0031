//! Spindle Runtime - The per-workspace orchestrator.
//!
//! Owns every subsystem: the event store, evidence ledger, replay engine,
//! file-change tracker, context budget and planner, skill gate, cost and
//! parallel budgets, verification gate, turn WAL, and scheduler. External
//! collaborators (the LLM client, terminal UI, channel adapters, the
//! subprocess registry) drive it through a small API surface:
//! `start_tool_call` / `finish_tool_call` around every tool invocation,
//! `plan_context` before every agent turn, `verify_completion` when the
//! agent claims done, and the scheduler's intent lifecycle.
//!
//! One process owns a workspace: the PID record at
//! `.spindle/scheduler.pid` is held under an exclusive file lock for the
//! lifetime of the runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config_bridge;
mod error;
mod lock;
mod logging;
mod runtime;

pub use error::{RuntimeError, RuntimeResult};
pub use lock::WorkspaceLock;
pub use logging::init_logging;
pub use runtime::{
    FinishToolCall, RecoverySummary, Runtime, RuntimeBuilder, StartOutcome, StartToolCall,
    ToolCallPhase,
};

// The seams collaborators implement or consume.
pub use spindle_schedule::{ExecutionOutcome, ExecutorError, IntentExecutor};
