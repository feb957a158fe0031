//! Runtime error types.

use thiserror::Error;

use spindle_core::ErrorCode;

/// Errors surfaced at the runtime API boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration failed to load.
    #[error(transparent)]
    Config(#[from] spindle_config::ConfigError),

    /// The event store rejected an append.
    #[error(transparent)]
    Events(#[from] spindle_events::EventError),

    /// The evidence ledger failed.
    #[error(transparent)]
    Ledger(#[from] spindle_ledger::LedgerError),

    /// The file-change tracker failed.
    #[error(transparent)]
    Patch(#[from] spindle_patch::PatchError),

    /// The turn WAL failed.
    #[error(transparent)]
    Wal(#[from] spindle_wal::WalError),

    /// The scheduler failed.
    #[error(transparent)]
    Schedule(#[from] spindle_schedule::ScheduleError),

    /// Another process owns this workspace.
    #[error("workspace is locked by another process: {0}")]
    WorkspaceLocked(String),
}

impl ErrorCode for RuntimeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "infra_config_load_failed",
            Self::Events(err) => err.code(),
            Self::Ledger(err) => err.code(),
            Self::Patch(err) => err.code(),
            Self::Wal(err) => err.code(),
            Self::Schedule(err) => err.code(),
            Self::WorkspaceLocked(_) => "conflict_workspace_locked",
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
