//! Spindle Config - Configuration for the Spindle workspace runtime.
//!
//! Configuration lives in `.spindle/config.json` inside the workspace as a
//! JSON overlay: every field is optional and defaults are supplied, so an
//! absent or empty file produces a fully working configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod loader;
mod types;
mod validate;

pub use loader::{ConfigError, ConfigResult, load_config, state_dir};
pub use types::{
    Config, ContextBudgetSection, CostSection, EnforcementMode, EventsSection,
    InfrastructureSection, LedgerSection, ParallelSection, PatchSection, ScheduleSection,
    SecuritySection, TapePressureThresholds, TapeSection, TruncationStrategy, TurnWalSection,
    VerificationLevel, VerificationSection,
};
pub use validate::validate;

/// Directory name for all persisted runtime state, workspace-relative.
pub const STATE_DIR: &str = ".spindle";
