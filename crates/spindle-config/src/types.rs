//! Configuration types for the Spindle runtime.
//!
//! All types in this module are self-contained with no dependencies on
//! other internal spindle crates. Every struct implements [`Default`] with
//! production defaults so that a bare `{}` overlay produces a working
//! configuration. Wire names are camelCase to match the on-disk overlay.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the Spindle runtime.
///
/// Loaded from `.spindle/config.json` with every field optional; absent
/// sections and fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Event store behaviour.
    pub events: EventsSection,
    /// Evidence ledger compaction and digest windows.
    pub ledger: LedgerSection,
    /// Tape pressure thresholds and checkpoint cadence.
    pub tape: TapeSection,
    /// Context budget and turn-WAL infrastructure.
    pub infrastructure: InfrastructureSection,
    /// Scheduler limits and intervals.
    pub schedule: ScheduleSection,
    /// Tool access policy and skill cap enforcement modes.
    pub security: SecuritySection,
    /// Verification levels, required checks, and commands.
    pub verification: VerificationSection,
    /// Parallel worker admission.
    pub parallel: ParallelSection,
    /// Mutation tool classification for the file-change tracker.
    pub patch: PatchSection,
    /// Token/USD cost accounting.
    pub cost: CostSection,
}

// ---------------------------------------------------------------------------
// EventsSection
// ---------------------------------------------------------------------------

/// Event store behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventsSection {
    /// When false, `append` fails with `infra_events_store_disabled` and
    /// callers treat events as best-effort.
    pub enabled: bool,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// LedgerSection
// ---------------------------------------------------------------------------

/// Evidence ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LedgerSection {
    /// Compact a session's ledger every N turns.
    pub checkpoint_every_turns: u64,
    /// Number of recent rows included in the rolling digest.
    pub digest_window: usize,
    /// Token budget for the rolling digest block.
    pub digest_max_tokens: usize,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            checkpoint_every_turns: 20,
            digest_window: 12,
            digest_max_tokens: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// TapeSection
// ---------------------------------------------------------------------------

/// Tape status computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TapeSection {
    /// Emit a checkpoint event every N non-checkpoint events.
    pub checkpoint_interval_entries: u64,
    /// Entries-since-anchor thresholds for pressure classification.
    pub tape_pressure_thresholds: TapePressureThresholds,
}

impl Default for TapeSection {
    fn default() -> Self {
        Self {
            checkpoint_interval_entries: 200,
            tape_pressure_thresholds: TapePressureThresholds::default(),
        }
    }
}

/// Ordinal thresholds over entries-since-anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TapePressureThresholds {
    /// At or above: pressure is at least `low`.
    pub low: u64,
    /// At or above: pressure is at least `medium`.
    pub medium: u64,
    /// At or above: pressure is `high`.
    pub high: u64,
}

impl Default for TapePressureThresholds {
    fn default() -> Self {
        Self {
            low: 40,
            medium: 120,
            high: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// InfrastructureSection
// ---------------------------------------------------------------------------

/// Infrastructure: context budget and turn WAL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InfrastructureSection {
    /// Context budget manager settings.
    pub context_budget: ContextBudgetSection,
    /// Turn write-ahead log settings.
    pub turn_wal: TurnWalSection,
}

/// Context budget manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextBudgetSection {
    /// Master switch for budget tracking and the compaction gate.
    pub enabled: bool,
    /// Token budget for a single assembled injection block.
    pub max_injection_tokens: usize,
    /// Usage ratio (0-1) at which compaction is requested.
    pub compaction_threshold_percent: f64,
    /// Usage ratio (0-1) at which the gate arms and injections are rejected.
    pub hard_limit_percent: f64,
    /// How oversized injections are reduced to fit.
    pub truncation_strategy: TruncationStrategy,
    /// Instructions surfaced to the agent when compaction is requested.
    pub compaction_instructions: String,
    /// Minimum turns between two compactions.
    pub min_turns_between_compaction: u64,
}

impl Default for ContextBudgetSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_injection_tokens: 2_000,
            compaction_threshold_percent: 0.7,
            hard_limit_percent: 0.85,
            truncation_strategy: TruncationStrategy::Tail,
            compaction_instructions:
                "Summarize completed work, keep open blockers and next steps.".to_owned(),
            min_turns_between_compaction: 2,
        }
    }
}

/// How an over-budget injection is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationStrategy {
    /// Drop whole entries from the end until the block fits.
    DropEntry,
    /// Replace the overflow with a one-line summary.
    Summarize,
    /// Keep the trailing slice of the block.
    Tail,
}

/// Turn write-ahead log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TurnWalSection {
    /// Master switch for the WAL.
    pub enabled: bool,
    /// TTL for records without an explicit one.
    pub default_ttl_ms: i64,
    /// Recovery retry cap for pending records.
    pub max_retries: u32,
    /// Terminal records older than this are deleted by `compact`.
    pub compact_after_ms: i64,
    /// TTL for schedule-sourced turns.
    pub schedule_turn_ttl_ms: i64,
}

impl Default for TurnWalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: 10 * 60 * 1000,
            max_retries: 3,
            compact_after_ms: 24 * 60 * 60 * 1000,
            schedule_turn_ttl_ms: 30 * 60 * 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleSection
// ---------------------------------------------------------------------------

/// Scheduler limits and intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScheduleSection {
    /// Master switch for the scheduler.
    pub enabled: bool,
    /// Minimum spacing between two fires of the same intent.
    pub min_interval_ms: i64,
    /// Lease duration taken around a fire.
    pub lease_duration_ms: i64,
    /// Cap on active intents per parent session.
    pub max_active_intents_per_session: usize,
    /// Cap on active intents across the workspace.
    pub max_active_intents_global: usize,
    /// Consecutive executor errors before the circuit opens.
    pub max_consecutive_errors: u32,
    /// Missed fires executed immediately during recovery; the surplus is
    /// deferred with spaced `nextRunAt`.
    pub max_recovery_catch_ups: usize,
    /// Base for the exponential error backoff.
    pub error_backoff_base_ms: i64,
    /// Ceiling for the exponential error backoff.
    pub error_backoff_cap_ms: i64,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 60_000,
            lease_duration_ms: 120_000,
            max_active_intents_per_session: 16,
            max_active_intents_global: 64,
            max_consecutive_errors: 3,
            max_recovery_catch_ups: 1,
            error_backoff_base_ms: 60_000,
            error_backoff_cap_ms: 60 * 60 * 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// SecuritySection
// ---------------------------------------------------------------------------

/// Enforcement mode for a policy dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMode {
    /// No checking at all.
    Off,
    /// Check and emit a one-time event, but allow.
    Warn,
    /// Check and reject.
    Enforce,
}

impl EnforcementMode {
    /// Whether this mode performs the check at all.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Tool access policy and skill cap enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecuritySection {
    /// Enforcement of the active skill's tool allow-list.
    pub allowed_tools_mode: EnforcementMode,
    /// Whether skill-declared denied tools are rejected.
    pub enforce_denied_tools: bool,
    /// Enforcement of per-skill token budgets.
    pub skill_max_tokens_mode: EnforcementMode,
    /// Enforcement of per-skill tool-call budgets.
    pub skill_max_tool_calls_mode: EnforcementMode,
    /// Enforcement of per-skill parallel caps.
    pub skill_max_parallel_mode: EnforcementMode,
    /// Whether prompts are sanitized before scoring and injection.
    pub sanitize_context: bool,
    /// Workspace-wide tool deny patterns (best-effort glob match).
    pub command_deny_list: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            allowed_tools_mode: EnforcementMode::Warn,
            enforce_denied_tools: true,
            skill_max_tokens_mode: EnforcementMode::Warn,
            skill_max_tool_calls_mode: EnforcementMode::Warn,
            skill_max_parallel_mode: EnforcementMode::Enforce,
            sanitize_context: true,
            command_deny_list: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// VerificationSection
// ---------------------------------------------------------------------------

/// Verification depth requested at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Evidence-only; no commands are executed.
    Quick,
    /// Default level; runs the configured standard checks.
    Standard,
    /// Everything in standard plus the thorough checks.
    Thorough,
}

impl VerificationLevel {
    /// Canonical name used as a key in the checks map.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
        }
    }
}

/// Verification levels, required checks, and commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VerificationSection {
    /// Level used when the caller does not specify one.
    pub default_level: VerificationLevel,
    /// Check names required per level, keyed by level name.
    pub checks: HashMap<String, Vec<String>>,
    /// Shell command per check name.
    pub commands: HashMap<String, String>,
    /// Hard timeout applied to every check command.
    pub timeout_ms: u64,
}

impl Default for VerificationSection {
    fn default() -> Self {
        let mut checks = HashMap::new();
        checks.insert("quick".to_owned(), Vec::new());
        checks.insert("standard".to_owned(), vec!["type-check".to_owned()]);
        checks.insert(
            "thorough".to_owned(),
            vec!["type-check".to_owned(), "test".to_owned()],
        );
        Self {
            default_level: VerificationLevel::Standard,
            checks,
            commands: HashMap::new(),
            timeout_ms: 120_000,
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelSection
// ---------------------------------------------------------------------------

/// Parallel worker admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParallelSection {
    /// Master switch; when off, `acquire` always succeeds.
    pub enabled: bool,
    /// Workspace-wide cap on concurrent worker slots per session.
    pub max_concurrent: usize,
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// PatchSection
// ---------------------------------------------------------------------------

/// Mutation tool classification for the file-change tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatchSection {
    /// Tool names treated as mutation tools (matched case-insensitively).
    pub mutation_tools: Vec<String>,
    /// Cap on patch sets retained per session.
    pub max_history_per_session: usize,
    /// Whether a unified line diff is stored alongside the hashes.
    pub record_diff_text: bool,
}

impl Default for PatchSection {
    fn default() -> Self {
        Self {
            mutation_tools: vec![
                "edit".to_owned(),
                "write".to_owned(),
                "apply_patch".to_owned(),
                "create_file".to_owned(),
                "delete_file".to_owned(),
                "rename_file".to_owned(),
                "move_file".to_owned(),
            ],
            max_history_per_session: 50,
            record_diff_text: true,
        }
    }
}

// ---------------------------------------------------------------------------
// CostSection
// ---------------------------------------------------------------------------

/// Token/USD cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CostSection {
    /// Master switch for cost accounting and budget blocks.
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

impl Default for CostSection {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_overlay_is_default() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert!(cfg.events.enabled);
        assert_eq!(cfg.schedule.max_consecutive_errors, 3);
        assert_eq!(cfg.infrastructure.context_budget.max_injection_tokens, 2_000);
    }

    #[test]
    fn test_partial_section_keeps_sibling_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"schedule": {"minIntervalMs": 1000}}"#).unwrap();
        assert_eq!(cfg.schedule.min_interval_ms, 1000);
        // Untouched sibling keeps its default.
        assert_eq!(cfg.schedule.lease_duration_ms, 120_000);
    }

    #[test]
    fn test_truncation_strategy_wire_names() {
        let cfg: Config = serde_json::from_str(
            r#"{"infrastructure": {"contextBudget": {"truncationStrategy": "drop-entry"}}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.infrastructure.context_budget.truncation_strategy,
            TruncationStrategy::DropEntry
        );
    }

    #[test]
    fn test_default_checks_cover_levels() {
        let v = VerificationSection::default();
        assert!(v.checks["quick"].is_empty());
        assert_eq!(v.checks["standard"], vec!["type-check"]);
    }

    #[test]
    fn test_round_trip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.patch.mutation_tools,
            Config::default().patch.mutation_tools
        );
    }
}
