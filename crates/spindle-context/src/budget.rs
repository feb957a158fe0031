//! The context budget manager and compaction gate.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use spindle_core::{ErrorCode, SessionId, TimestampMs, estimate_tokens, now_ms};

/// How an over-budget injection is reduced (mirrors the config section).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TruncationStrategy {
    /// Drop whole entries (lines) from the end until the block fits.
    DropEntry,
    /// Keep the head and replace the overflow with a one-line note.
    Summarize,
    /// Keep the trailing slice.
    #[default]
    Tail,
}

/// Budget configuration (mirrors `infrastructure.contextBudget`).
#[derive(Debug, Clone)]
pub struct ContextBudgetConfig {
    /// Master switch.
    pub enabled: bool,
    /// Token budget for one assembled injection block.
    pub max_injection_tokens: usize,
    /// Usage ratio at which compaction is requested.
    pub compaction_threshold_ratio: f64,
    /// Usage ratio at which the gate arms.
    pub hard_limit_ratio: f64,
    /// Truncation strategy for oversized injections.
    pub truncation_strategy: TruncationStrategy,
    /// Minimum turns between two compactions.
    pub min_turns_between_compaction: u64,
}

impl Default for ContextBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_injection_tokens: 2_000,
            compaction_threshold_ratio: 0.7,
            hard_limit_ratio: 0.85,
            truncation_strategy: TruncationStrategy::Tail,
            min_turns_between_compaction: 2,
        }
    }
}

/// A context usage observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    /// Tokens in the context window.
    pub tokens: u64,
    /// The window size.
    pub context_window: u64,
    /// `tokens / contextWindow`, when computable.
    pub percent: f64,
}

impl ContextUsage {
    /// Build an observation, computing the ratio.
    #[must_use]
    pub fn new(tokens: u64, context_window: u64) -> Self {
        let percent = if context_window == 0 {
            0.0
        } else {
            tokens as f64 / context_window as f64
        };
        Self {
            tokens,
            context_window,
            percent,
        }
    }

    fn ratio(&self) -> Option<f64> {
        (self.context_window > 0).then_some(self.percent)
    }
}

/// Ordinal pressure over the usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPressure {
    /// Below every threshold.
    None,
    /// Approaching the compaction threshold.
    Low,
    /// Closer still.
    Medium,
    /// At or above the compaction threshold.
    High,
    /// At or above the hard limit.
    Critical,
    /// Ratio could not be computed.
    Unknown,
}

/// Classify a usage ratio against the configured thresholds.
#[must_use]
pub fn classify_pressure(
    ratio: Option<f64>,
    compaction_threshold: f64,
    hard_limit: f64,
) -> ContextPressure {
    let Some(ratio) = ratio else {
        return ContextPressure::Unknown;
    };
    if ratio >= hard_limit {
        ContextPressure::Critical
    } else if ratio >= compaction_threshold {
        ContextPressure::High
    } else if ratio >= (0.75 * compaction_threshold).max(0.5) {
        ContextPressure::Medium
    } else if ratio >= (0.5 * compaction_threshold).max(0.25) {
        ContextPressure::Low
    } else {
        ContextPressure::None
    }
}

/// The dedup/reservation key for a session branch.
///
/// Parallel branches of one session carry a scope id; `None` maps to the
/// root scope.
#[must_use]
pub fn scope_key(session_id: &SessionId, scope: Option<&str>) -> String {
    format!("{}::{}", session_id, scope.unwrap_or("root"))
}

/// Outcome of planning one injection against the budget.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionPlan {
    /// Whether anything is injected at all.
    pub accepted: bool,
    /// The (possibly truncated) text.
    pub final_text: String,
    /// Tokens before truncation.
    pub original_tokens: usize,
    /// Tokens after truncation.
    pub final_tokens: usize,
    /// Whether truncation happened.
    pub truncated: bool,
    /// Why the injection was dropped, when it was.
    pub dropped_reason: Option<String>,
}

/// Compaction recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionDecision {
    /// True when a compaction should be requested this turn.
    pub should_compact: bool,
    /// Why (or why not).
    pub reason: String,
    /// The observed usage.
    pub usage: Option<ContextUsage>,
}

/// A tool call rejected by the compaction gate.
#[derive(Debug, Error)]
#[error(
    "Context usage is critical. Call tool 'session_compact' first; other tools are blocked until the context is compacted."
)]
pub struct GateBlocked {
    /// The rejected tool.
    pub tool_name: String,
}

impl ErrorCode for GateBlocked {
    fn code(&self) -> &'static str {
        "context_compaction_gate_blocked_tool"
    }
}

#[derive(Default)]
struct SessionBudget {
    turn_index: u64,
    last_compaction_turn: Option<u64>,
    last_compaction_at_ms: Option<TimestampMs>,
    last_usage: Option<ContextUsage>,
    /// Sticky once usage crosses the hard limit; cleared by compaction.
    gate_armed: bool,
    /// Tokens reserved this turn, per scope key.
    reservations: HashMap<String, usize>,
    /// Fingerprint of the last injected block, per scope key.
    fingerprints: HashMap<String, spindle_core::ContentHash>,
}

/// Tracks per-session context usage and gates tool calls under pressure.
pub struct ContextBudget {
    config: ContextBudgetConfig,
    sessions: Mutex<HashMap<SessionId, SessionBudget>>,
}

impl ContextBudget {
    /// Create a budget manager.
    #[must_use]
    pub fn new(config: ContextBudgetConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The configuration in force.
    #[must_use]
    pub fn config(&self) -> &ContextBudgetConfig {
        &self.config
    }

    /// Start a turn: bump the counter and reset per-turn reservations.
    pub fn begin_turn(&self, session_id: &SessionId, turn_index: u64) {
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        session.turn_index = turn_index;
        session.reservations.clear();
    }

    /// Record a usage observation; arms the gate at critical pressure.
    ///
    /// Returns `true` when this observation newly armed the gate.
    pub fn observe_usage(&self, session_id: &SessionId, usage: ContextUsage) -> bool {
        if !self.config.enabled {
            return false;
        }
        let pressure = classify_pressure(
            usage.ratio(),
            self.config.compaction_threshold_ratio,
            self.config.hard_limit_ratio,
        );
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        session.last_usage = Some(usage);

        let newly_armed = pressure == ContextPressure::Critical && !session.gate_armed;
        if newly_armed {
            debug!(session = %session_id, percent = usage.percent, "compaction gate armed");
            session.gate_armed = true;
        }
        newly_armed
    }

    /// The last observed usage.
    #[must_use]
    pub fn last_usage(&self, session_id: &SessionId) -> Option<ContextUsage> {
        self.lock().get(session_id).and_then(|s| s.last_usage)
    }

    /// Current pressure for a session.
    #[must_use]
    pub fn pressure(&self, session_id: &SessionId) -> ContextPressure {
        let usage = self.last_usage(session_id);
        classify_pressure(
            usage.and_then(|u| u.ratio()),
            self.config.compaction_threshold_ratio,
            self.config.hard_limit_ratio,
        )
    }

    /// Plan fitting `input_text` into the window.
    ///
    /// Rejects with `hard_limit` when adding the text would cross the
    /// hard-limit ratio; otherwise truncates to the injection budget per
    /// the configured strategy.
    #[must_use]
    pub fn plan_injection(
        &self,
        _session_id: &SessionId,
        input_text: &str,
        usage: Option<ContextUsage>,
    ) -> InjectionPlan {
        let original_tokens = estimate_tokens(input_text);
        if !self.config.enabled {
            return InjectionPlan {
                accepted: true,
                final_text: input_text.to_owned(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                dropped_reason: None,
            };
        }

        if let Some(usage) = usage
            && usage.context_window > 0
        {
            let projected =
                (usage.tokens as f64 + original_tokens as f64) / usage.context_window as f64;
            if projected >= self.config.hard_limit_ratio {
                return InjectionPlan {
                    accepted: false,
                    final_text: String::new(),
                    original_tokens,
                    final_tokens: 0,
                    truncated: false,
                    dropped_reason: Some("hard_limit".to_owned()),
                };
            }
        }

        let budget = self.config.max_injection_tokens;
        if original_tokens <= budget {
            return InjectionPlan {
                accepted: true,
                final_text: input_text.to_owned(),
                original_tokens,
                final_tokens: original_tokens,
                truncated: false,
                dropped_reason: None,
            };
        }

        let final_text = truncate(input_text, budget, self.config.truncation_strategy);
        let final_tokens = estimate_tokens(&final_text);
        InjectionPlan {
            accepted: true,
            final_text,
            original_tokens,
            final_tokens,
            truncated: true,
            dropped_reason: None,
        }
    }

    /// Whether a compaction should be requested.
    #[must_use]
    pub fn should_request_compaction(
        &self,
        session_id: &SessionId,
        usage: ContextUsage,
    ) -> CompactionDecision {
        if !self.config.enabled {
            return CompactionDecision {
                should_compact: false,
                reason: "context budget disabled".to_owned(),
                usage: Some(usage),
            };
        }

        let Some(ratio) = usage.ratio() else {
            return CompactionDecision {
                should_compact: false,
                reason: "usage ratio unknown".to_owned(),
                usage: Some(usage),
            };
        };

        if ratio < self.config.compaction_threshold_ratio {
            return CompactionDecision {
                should_compact: false,
                reason: format!(
                    "usage {:.2} below threshold {:.2}",
                    ratio, self.config.compaction_threshold_ratio
                ),
                usage: Some(usage),
            };
        }

        let sessions = self.lock();
        let turns_since = sessions.get(session_id).map_or(u64::MAX, |s| {
            s.last_compaction_turn
                .map_or(u64::MAX, |last| s.turn_index.saturating_sub(last))
        });
        if turns_since < self.config.min_turns_between_compaction {
            return CompactionDecision {
                should_compact: false,
                reason: format!("compacted {turns_since} turns ago"),
                usage: Some(usage),
            };
        }

        CompactionDecision {
            should_compact: true,
            reason: format!(
                "usage {:.2} at or above threshold {:.2}",
                ratio, self.config.compaction_threshold_ratio
            ),
            usage: Some(usage),
        }
    }

    /// Record that a compaction happened; clears the gate.
    pub fn mark_compacted(&self, session_id: &SessionId) {
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        session.last_compaction_turn = Some(session.turn_index);
        session.last_compaction_at_ms = Some(now_ms());
        session.gate_armed = false;
    }

    /// When the session last compacted, if it has.
    #[must_use]
    pub fn last_compacted_at(&self, session_id: &SessionId) -> Option<TimestampMs> {
        self.lock()
            .get(session_id)
            .and_then(|s| s.last_compaction_at_ms)
    }

    /// Whether the compaction gate is in force for a session.
    ///
    /// The gate requires pressure to have reached critical (sticky) with
    /// no compaction within `min_turns_between_compaction` turns.
    #[must_use]
    pub fn gate_required(&self, session_id: &SessionId) -> bool {
        if !self.config.enabled {
            return false;
        }
        let sessions = self.lock();
        let Some(session) = sessions.get(session_id) else {
            return false;
        };
        if !session.gate_armed {
            return false;
        }
        session.last_compaction_turn.is_none_or(|last| {
            session.turn_index.saturating_sub(last) >= self.config.min_turns_between_compaction
        })
    }

    /// Gate one tool call. `session_compact` always passes.
    ///
    /// # Errors
    ///
    /// Returns [`GateBlocked`] for any other tool while the gate is
    /// in force.
    pub fn check_gate(&self, session_id: &SessionId, tool_name: &str) -> Result<(), GateBlocked> {
        if tool_name == "session_compact" || !self.gate_required(session_id) {
            return Ok(());
        }
        Err(GateBlocked {
            tool_name: tool_name.to_owned(),
        })
    }

    /// Reserve tokens for a scope this turn, capped by the injection
    /// budget. Returns the tokens actually granted.
    #[must_use]
    pub fn reserve(&self, session_id: &SessionId, scope: Option<&str>, tokens: usize) -> usize {
        let key = scope_key(session_id, scope);
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        let used = session.reservations.entry(key).or_insert(0);
        let granted = tokens.min(self.config.max_injection_tokens.saturating_sub(*used));
        *used += granted;
        granted
    }

    /// The last injected fingerprint for a scope.
    #[must_use]
    pub fn last_fingerprint(
        &self,
        session_id: &SessionId,
        scope: Option<&str>,
    ) -> Option<spindle_core::ContentHash> {
        let key = scope_key(session_id, scope);
        self.lock()
            .get(session_id)
            .and_then(|s| s.fingerprints.get(&key).copied())
    }

    /// Record the fingerprint of an injected block for a scope.
    pub fn set_fingerprint(
        &self,
        session_id: &SessionId,
        scope: Option<&str>,
        fingerprint: spindle_core::ContentHash,
    ) {
        let key = scope_key(session_id, scope);
        let mut sessions = self.lock();
        sessions
            .entry(session_id.clone())
            .or_default()
            .fingerprints
            .insert(key, fingerprint);
    }

    /// Current turn index for a session.
    #[must_use]
    pub fn turn_index(&self, session_id: &SessionId) -> u64 {
        self.lock().get(session_id).map_or(0, |s| s.turn_index)
    }

    /// Drop all per-session state (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionBudget>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ContextBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBudget")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn truncate(text: &str, budget_tokens: usize, strategy: TruncationStrategy) -> String {
    let budget_chars = budget_tokens.saturating_mul(4);
    match strategy {
        TruncationStrategy::Tail => {
            let chars: Vec<char> = text.chars().collect();
            let start = chars.len().saturating_sub(budget_chars);
            chars[start..].iter().collect()
        },
        TruncationStrategy::DropEntry => {
            let mut out = String::new();
            for line in text.lines() {
                if estimate_tokens(&out) + estimate_tokens(line) + 1 > budget_tokens {
                    break;
                }
                out.push_str(line);
                out.push('\n');
            }
            out
        },
        TruncationStrategy::Summarize => {
            let keep_chars = budget_chars.saturating_sub(48);
            let head: String = text.chars().take(keep_chars).collect();
            let dropped = estimate_tokens(text).saturating_sub(estimate_tokens(&head));
            format!("{head}\n[... {dropped} tokens truncated ...]")
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> ContextBudget {
        ContextBudget::new(ContextBudgetConfig {
            max_injection_tokens: 50,
            ..ContextBudgetConfig::default()
        })
    }

    #[test]
    fn test_pressure_ladder() {
        // threshold 0.7, hard 0.85
        assert_eq!(classify_pressure(None, 0.7, 0.85), ContextPressure::Unknown);
        assert_eq!(classify_pressure(Some(0.1), 0.7, 0.85), ContextPressure::None);
        assert_eq!(classify_pressure(Some(0.4), 0.7, 0.85), ContextPressure::Low);
        assert_eq!(classify_pressure(Some(0.6), 0.7, 0.85), ContextPressure::Medium);
        assert_eq!(classify_pressure(Some(0.7), 0.7, 0.85), ContextPressure::High);
        assert_eq!(classify_pressure(Some(0.9), 0.7, 0.85), ContextPressure::Critical);
    }

    #[test]
    fn test_pressure_floors_for_low_thresholds() {
        // With a very low threshold the medium/low bands floor at 0.5/0.25.
        assert_eq!(classify_pressure(Some(0.3), 0.1, 0.85), ContextPressure::High);
        assert_eq!(classify_pressure(Some(0.05), 0.4, 0.85), ContextPressure::None);
    }

    #[test]
    fn test_plan_injection_hard_limit() {
        let budget = budget();
        let usage = ContextUsage::new(95_000, 100_000);
        let plan = budget.plan_injection(&"s1".into(), "some context", Some(usage));
        assert!(!plan.accepted);
        assert_eq!(plan.dropped_reason.as_deref(), Some("hard_limit"));
    }

    #[test]
    fn test_plan_injection_truncates_tail() {
        let budget = budget();
        let text = "x".repeat(1000);
        let plan = budget.plan_injection(&"s1".into(), &text, None);
        assert!(plan.accepted);
        assert!(plan.truncated);
        assert!(plan.final_tokens <= 50);
    }

    #[test]
    fn test_compaction_needs_threshold_and_spacing() {
        let budget = budget();
        let session: SessionId = "s1".into();

        budget.begin_turn(&session, 1);
        let decision = budget.should_request_compaction(&session, ContextUsage::new(80, 100));
        assert!(decision.should_compact);

        budget.mark_compacted(&session);
        budget.begin_turn(&session, 2);
        let decision = budget.should_request_compaction(&session, ContextUsage::new(80, 100));
        assert!(!decision.should_compact);

        budget.begin_turn(&session, 3);
        let decision = budget.should_request_compaction(&session, ContextUsage::new(80, 100));
        assert!(decision.should_compact);
    }

    #[test]
    fn test_gate_arms_blocks_and_clears() {
        let budget = budget();
        let session: SessionId = "s1".into();

        budget.begin_turn(&session, 1);
        let armed = budget.observe_usage(&session, ContextUsage::new(95, 100));
        assert!(armed);
        // Arming again is not "newly armed".
        assert!(!budget.observe_usage(&session, ContextUsage::new(96, 100)));

        let err = budget.check_gate(&session, "lsp_symbols").unwrap_err();
        assert!(err.to_string().contains("session_compact"));
        assert!(budget.check_gate(&session, "session_compact").is_ok());

        budget.mark_compacted(&session);
        assert!(budget.check_gate(&session, "lsp_symbols").is_ok());
    }

    #[test]
    fn test_gate_is_sticky_across_turns() {
        let budget = budget();
        let session: SessionId = "s1".into();
        budget.begin_turn(&session, 1);
        budget.observe_usage(&session, ContextUsage::new(95, 100));
        // Pressure falls, but the gate stays until a compaction lands.
        budget.begin_turn(&session, 2);
        budget.observe_usage(&session, ContextUsage::new(40, 100));
        assert!(budget.check_gate(&session, "read").is_err());
    }

    #[test]
    fn test_reservation_caps_at_budget() {
        let budget = budget();
        let session: SessionId = "s1".into();
        budget.begin_turn(&session, 1);
        assert_eq!(budget.reserve(&session, Some("branch-a"), 30), 30);
        assert_eq!(budget.reserve(&session, Some("branch-a"), 30), 20);
        assert_eq!(budget.reserve(&session, Some("branch-a"), 30), 0);
        // A different scope has its own pool.
        assert_eq!(budget.reserve(&session, None, 30), 30);
        // A new turn resets reservations.
        budget.begin_turn(&session, 2);
        assert_eq!(budget.reserve(&session, Some("branch-a"), 30), 30);
    }

    #[test]
    fn test_scope_key_form() {
        assert_eq!(scope_key(&"s1".into(), None), "s1::root");
        assert_eq!(scope_key(&"s1".into(), Some("b")), "s1::b");
    }
}
