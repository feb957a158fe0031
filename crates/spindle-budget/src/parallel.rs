//! Parallel worker slot admission.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use spindle_core::{ErrorCode, SessionId};

/// Parallel admission configuration.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Master switch; when off, acquisition always succeeds.
    pub enabled: bool,
    /// Cap on concurrent slots per session.
    pub max_concurrent: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
        }
    }
}

/// Errors raised by slot acquisition.
#[derive(Debug, Error)]
pub enum ParallelError {
    /// The session-wide cap is exhausted.
    #[error("session {session} has all {limit} parallel slots in use")]
    SessionLimit {
        /// The session.
        session: SessionId,
        /// The configured cap.
        limit: usize,
    },

    /// The active skill's own cap is exhausted.
    #[error("skill {skill} has all {limit} parallel slots in use")]
    SkillLimit {
        /// The skill.
        skill: String,
        /// The skill's declared cap.
        limit: usize,
    },
}

impl ErrorCode for ParallelError {
    fn code(&self) -> &'static str {
        match self {
            Self::SessionLimit { .. } => "limit_max_parallel",
            Self::SkillLimit { .. } => "limit_skill_max_parallel",
        }
    }
}

/// Result type for slot acquisition.
pub type ParallelResult<T> = Result<T, ParallelError>;

#[derive(Default)]
struct SessionSlots {
    /// run id to skill holding the slot (if any).
    runs: HashMap<String, Option<String>>,
}

/// Admission control for parallel worker slots.
pub struct ParallelBudget {
    config: ParallelConfig,
    sessions: Mutex<HashMap<SessionId, SessionSlots>>,
}

impl ParallelBudget {
    /// Create a budget with the given configuration.
    #[must_use]
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a slot for a run.
    ///
    /// Re-acquiring with the same `run_id` is a no-op success. `skill`
    /// carries the active skill's name and declared `maxParallel` cap.
    ///
    /// # Errors
    ///
    /// Returns a limit error when the session or skill cap is exhausted.
    pub fn acquire_slot(
        &self,
        session_id: &SessionId,
        run_id: &str,
        skill: Option<(&str, usize)>,
    ) -> ParallelResult<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let slots = sessions.entry(session_id.clone()).or_default();

        if slots.runs.contains_key(run_id) {
            return Ok(());
        }

        if slots.runs.len() >= self.config.max_concurrent {
            return Err(ParallelError::SessionLimit {
                session: session_id.clone(),
                limit: self.config.max_concurrent,
            });
        }

        if let Some((skill_name, skill_limit)) = skill {
            let in_use = slots
                .runs
                .values()
                .filter(|s| s.as_deref() == Some(skill_name))
                .count();
            if in_use >= skill_limit {
                return Err(ParallelError::SkillLimit {
                    skill: skill_name.to_owned(),
                    limit: skill_limit,
                });
            }
        }

        debug!(session = %session_id, run = run_id, "parallel slot acquired");
        slots
            .runs
            .insert(run_id.to_owned(), skill.map(|(name, _)| name.to_owned()));
        Ok(())
    }

    /// Release a run's slot. Idempotent; unknown runs are ignored.
    pub fn release_slot(&self, session_id: &SessionId, run_id: &str) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(slots) = sessions.get_mut(session_id) {
            slots.runs.remove(run_id);
            if slots.runs.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Slots currently in use for a session.
    #[must_use]
    pub fn in_use(&self, session_id: &SessionId) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .map_or(0, |s| s.runs.len())
    }

    /// Drop all slots for a session (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }
}

impl std::fmt::Debug for ParallelBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelBudget")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
