//! Scheduler error types.

use thiserror::Error;

use spindle_core::{ErrorCode, IntentId};

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The scheduler is turned off in configuration.
    #[error("scheduler is disabled")]
    Disabled,

    /// The cron expression did not parse.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The time zone is not a known IANA name.
    #[error("invalid time zone: {0}")]
    InvalidTimeZone(String),

    /// `runAt` is unusable (in the past, or not a timestamp).
    #[error("invalid runAt: {0}")]
    InvalidRunAt(String),

    /// The intent has no reason text.
    #[error("intent reason is required")]
    MissingReason,

    /// Neither `runAt` nor `cron` was given.
    #[error("one of runAt or cron is required")]
    MissingSchedule,

    /// `maxRuns` must be at least 1.
    #[error("maxRuns must be at least 1")]
    InvalidMaxRuns,

    /// An intent with that id already exists.
    #[error("intent id already exists: {0}")]
    IntentIdExists(IntentId),

    /// `runAt` and `cron` are mutually exclusive.
    #[error("runAt and cron are mutually exclusive")]
    RunAtAndCron,

    /// `timeZone` only makes sense with `cron`.
    #[error("timeZone requires cron")]
    TimeZoneRequiresCron,

    /// The workspace-wide active-intent cap is reached.
    #[error("global active intent limit {0} reached")]
    GlobalLimit(usize),

    /// The per-session active-intent cap is reached.
    #[error("per-session active intent limit {0} reached")]
    PerSessionLimit(usize),

    /// No intent with that id.
    #[error("intent not found: {0}")]
    NotFound(IntentId),

    /// The intent is not active.
    #[error("intent not active: {0}")]
    NotActive(IntentId),

    /// The caller does not own the intent.
    #[error("intent {0} belongs to another session")]
    OwnerMismatch(IntentId),

    /// The projection snapshot could not be persisted.
    #[error("intent projection persist failed: {0}")]
    PersistFailed(String),

    /// The event log rejected an append.
    #[error("event append failed: {0}")]
    Events(#[from] spindle_events::EventError),
}

impl ErrorCode for ScheduleError {
    fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "infra_schedule_disabled",
            Self::InvalidCron(_) => "invalid_cron",
            Self::InvalidTimeZone(_) => "invalid_time_zone",
            Self::InvalidRunAt(_) => "invalid_runAt",
            Self::MissingReason => "invalid_missing_reason",
            Self::MissingSchedule => "invalid_schedule",
            Self::InvalidMaxRuns => "invalid_maxRuns",
            Self::IntentIdExists(_) => "conflict_intent_id_already_exists",
            Self::RunAtAndCron => "conflict_runAt_and_cron_are_mutually_exclusive",
            Self::TimeZoneRequiresCron => "conflict_timeZone_requires_cron",
            Self::GlobalLimit(_) => "limit_max_active_intents_global_exceeded",
            Self::PerSessionLimit(_) => "limit_max_active_intents_per_session_exceeded",
            Self::NotFound(_) => "state_intent_not_found",
            Self::NotActive(_) => "state_intent_not_active",
            Self::OwnerMismatch(_) => "state_intent_owner_mismatch",
            Self::PersistFailed(_) => "infra_intent_persist_failed",
            Self::Events(_) => "infra_events_append_failed",
        }
    }
}

/// Result type for scheduler operations.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
