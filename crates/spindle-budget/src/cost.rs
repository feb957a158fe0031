//! Per-turn token/USD accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use spindle_core::SessionId;

/// Cost configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Master switch; when off, recording is a no-op and nothing blocks.
    pub enabled: bool,
    /// Maximum total session spend (USD). Zero disables the cap.
    pub session_max_usd: f64,
    /// Alert threshold as a percentage of the session cap (0-100).
    pub warn_at_percent: u8,
    /// USD per 1 million input tokens.
    pub input_per_million: f64,
    /// USD per 1 million output tokens.
    pub output_per_million: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_max_usd: 25.0,
            warn_at_percent: 80,
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

impl CostConfig {
    /// The alert threshold as a dollar amount.
    #[must_use]
    pub fn warn_threshold_usd(&self) -> f64 {
        self.session_max_usd * f64::from(self.warn_at_percent) / 100.0
    }
}

/// A threshold crossing worth surfacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAlert {
    /// Session spend at the crossing (USD).
    pub spent_usd: f64,
    /// The session cap (USD).
    pub session_max_usd: f64,
    /// Percentage of the cap used.
    pub percent_used: f64,
}

/// Result of recording a turn's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostOutcome {
    /// USD cost of this turn.
    pub turn_usd: f64,
    /// Cumulative session spend (USD).
    pub total_usd: f64,
    /// Emitted once per session when the warn threshold is crossed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<CostAlert>,
    /// True once the session cap is exhausted.
    pub blocked: bool,
}

/// Point-in-time view of a session's spend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    /// Cumulative input tokens.
    pub input_tokens: u64,
    /// Cumulative output tokens.
    pub output_tokens: u64,
    /// Cumulative spend (USD).
    pub spent_usd: f64,
    /// Remaining before the cap (USD); `None` when uncapped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_usd: Option<f64>,
    /// Whether the session is blocked on budget.
    pub blocked: bool,
}

#[derive(Default)]
struct SessionCost {
    input_tokens: u64,
    output_tokens: u64,
    spent_usd: f64,
    alerted: bool,
}

/// Tracks token/USD spend per session against a cap.
pub struct CostTracker {
    config: CostConfig,
    sessions: Mutex<HashMap<SessionId, SessionCost>>,
}

impl CostTracker {
    /// Create a tracker with the given configuration.
    #[must_use]
    pub fn new(config: CostConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one turn's usage.
    pub fn record_turn(
        &self,
        session_id: &SessionId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostOutcome {
        if !self.config.enabled {
            return CostOutcome {
                turn_usd: 0.0,
                total_usd: 0.0,
                alert: None,
                blocked: false,
            };
        }

        let turn_usd = (input_tokens as f64 / 1_000_000.0) * self.config.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.config.output_per_million;

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let session = sessions.entry(session_id.clone()).or_default();
        session.input_tokens += input_tokens;
        session.output_tokens += output_tokens;
        session.spent_usd += turn_usd;

        let capped = self.config.session_max_usd > 0.0;
        let blocked = capped && session.spent_usd >= self.config.session_max_usd;
        let alert = if capped
            && !session.alerted
            && session.spent_usd >= self.config.warn_threshold_usd()
        {
            session.alerted = true;
            let alert = CostAlert {
                spent_usd: session.spent_usd,
                session_max_usd: self.config.session_max_usd,
                percent_used: session.spent_usd / self.config.session_max_usd * 100.0,
            };
            warn!(
                session = %session_id,
                spent = session.spent_usd,
                "session cost crossed the alert threshold"
            );
            Some(alert)
        } else {
            None
        };

        CostOutcome {
            turn_usd,
            total_usd: session.spent_usd,
            alert,
            blocked,
        }
    }

    /// Whether a session has exhausted its cap.
    #[must_use]
    pub fn is_blocked(&self, session_id: &SessionId) -> bool {
        if !self.config.enabled || self.config.session_max_usd <= 0.0 {
            return false;
        }
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|s| s.spent_usd >= self.config.session_max_usd)
    }

    /// Point-in-time snapshot for one session.
    #[must_use]
    pub fn snapshot(&self, session_id: &SessionId) -> CostSnapshot {
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(session) = sessions.get(session_id) else {
            return CostSnapshot::default();
        };
        let capped = self.config.session_max_usd > 0.0;
        CostSnapshot {
            input_tokens: session.input_tokens,
            output_tokens: session.output_tokens,
            spent_usd: session.spent_usd,
            remaining_usd: capped
                .then(|| (self.config.session_max_usd - session.spent_usd).max(0.0)),
            blocked: capped && session.spent_usd >= self.config.session_max_usd,
        }
    }

    /// Drop a session's accounting (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }
}

impl std::fmt::Debug for CostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max: f64) -> CostTracker {
        CostTracker::new(CostConfig {
            session_max_usd: max,
            ..CostConfig::default()
        })
    }

    #[test]
    fn test_turn_pricing() {
        let tracker = tracker(100.0);
        let outcome = tracker.record_turn(&"s1".into(), 1_000_000, 1_000_000);
        assert!((outcome.turn_usd - 18.0).abs() < f64::EPSILON);
        assert!(!outcome.blocked);
    }

    #[test]
    fn test_alert_fires_once() {
        let tracker = tracker(10.0);
        // 600k output tokens at $15/M = $9, past 80% of the $10 cap.
        let first = tracker.record_turn(&"s1".into(), 0, 600_000);
        assert!(first.alert.is_some());
        let second = tracker.record_turn(&"s1".into(), 0, 1);
        assert!(second.alert.is_none());
    }

    #[test]
    fn test_cap_blocks() {
        let tracker = tracker(1.0);
        let outcome = tracker.record_turn(&"s1".into(), 0, 100_000); // $1.50
        assert!(outcome.blocked);
        assert!(tracker.is_blocked(&"s1".into()));
        assert!(!tracker.is_blocked(&"s2".into()));
    }

    #[test]
    fn test_zero_cap_is_uncapped() {
        let tracker = tracker(0.0);
        tracker.record_turn(&"s1".into(), 0, 10_000_000);
        assert!(!tracker.is_blocked(&"s1".into()));
        assert!(tracker.snapshot(&"s1".into()).remaining_usd.is_none());
    }

    #[test]
    fn test_clear_session_resets() {
        let tracker = tracker(1.0);
        tracker.record_turn(&"s1".into(), 0, 100_000);
        tracker.clear_session(&"s1".into());
        assert!(!tracker.is_blocked(&"s1".into()));
        assert_eq!(tracker.snapshot(&"s1".into()), CostSnapshot::default());
    }
}
