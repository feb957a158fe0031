//! Conversion from the configuration tree to subsystem configs.
//!
//! Subsystem crates mirror their own config types and stay decoupled from
//! `spindle-config`; this module is the one place the two meet.

use spindle_budget::{CostConfig, ParallelConfig};
use spindle_config::{Config, EnforcementMode};
use spindle_context::{ContextBudgetConfig, PlannerConfig, TruncationStrategy};
use spindle_replay::TapeThresholds;
use spindle_schedule::ScheduleConfig;
use spindle_skills::{AccessConfig, Mode};
use spindle_verify::VerifyConfig;
use spindle_wal::WalConfig;

pub(crate) fn access_config(config: &Config) -> AccessConfig {
    AccessConfig {
        allowed_tools_mode: mode(config.security.allowed_tools_mode),
        enforce_denied_tools: config.security.enforce_denied_tools,
        skill_max_tokens_mode: mode(config.security.skill_max_tokens_mode),
        skill_max_tool_calls_mode: mode(config.security.skill_max_tool_calls_mode),
        command_deny_list: config.security.command_deny_list.clone(),
    }
}

pub(crate) fn context_config(config: &Config) -> ContextBudgetConfig {
    let section = &config.infrastructure.context_budget;
    ContextBudgetConfig {
        enabled: section.enabled,
        max_injection_tokens: section.max_injection_tokens,
        compaction_threshold_ratio: section.compaction_threshold_percent,
        hard_limit_ratio: section.hard_limit_percent,
        truncation_strategy: match section.truncation_strategy {
            spindle_config::TruncationStrategy::DropEntry => TruncationStrategy::DropEntry,
            spindle_config::TruncationStrategy::Summarize => TruncationStrategy::Summarize,
            spindle_config::TruncationStrategy::Tail => TruncationStrategy::Tail,
        },
        min_turns_between_compaction: section.min_turns_between_compaction,
    }
}

pub(crate) fn planner_config(config: &Config) -> PlannerConfig {
    PlannerConfig {
        sanitize: config.security.sanitize_context,
        top_k_skills: 3,
        digest_window: config.ledger.digest_window,
        digest_max_tokens: config.ledger.digest_max_tokens,
        tape_thresholds: tape_thresholds(config),
        compaction_instructions: config
            .infrastructure
            .context_budget
            .compaction_instructions
            .clone(),
    }
}

pub(crate) fn tape_thresholds(config: &Config) -> TapeThresholds {
    let t = &config.tape.tape_pressure_thresholds;
    TapeThresholds {
        low: t.low,
        medium: t.medium,
        high: t.high,
    }
}

pub(crate) fn cost_config(config: &Config) -> CostConfig {
    CostConfig {
        enabled: config.cost.enabled,
        session_max_usd: config.cost.session_max_usd,
        warn_at_percent: config.cost.warn_at_percent,
        input_per_million: config.cost.input_per_million,
        output_per_million: config.cost.output_per_million,
    }
}

pub(crate) fn parallel_config(config: &Config) -> ParallelConfig {
    ParallelConfig {
        enabled: config.parallel.enabled,
        max_concurrent: config.parallel.max_concurrent,
    }
}

pub(crate) fn verify_config(config: &Config) -> VerifyConfig {
    VerifyConfig {
        checks: config.verification.checks.clone(),
        commands: config.verification.commands.clone(),
        timeout_ms: config.verification.timeout_ms,
    }
}

pub(crate) fn wal_config(config: &Config) -> WalConfig {
    let section = &config.infrastructure.turn_wal;
    WalConfig {
        enabled: section.enabled,
        default_ttl_ms: section.default_ttl_ms,
        max_retries: section.max_retries,
        compact_after_ms: section.compact_after_ms,
    }
}

pub(crate) fn schedule_config(config: &Config) -> ScheduleConfig {
    let section = &config.schedule;
    ScheduleConfig {
        enabled: section.enabled,
        min_interval_ms: section.min_interval_ms,
        lease_duration_ms: section.lease_duration_ms,
        max_active_intents_per_session: section.max_active_intents_per_session,
        max_active_intents_global: section.max_active_intents_global,
        max_consecutive_errors: section.max_consecutive_errors,
        max_recovery_catch_ups: section.max_recovery_catch_ups,
        error_backoff_base_ms: section.error_backoff_base_ms,
        error_backoff_cap_ms: section.error_backoff_cap_ms,
    }
}

fn mode(mode: EnforcementMode) -> Mode {
    match mode {
        EnforcementMode::Off => Mode::Off,
        EnforcementMode::Warn => Mode::Warn,
        EnforcementMode::Enforce => Mode::Enforce,
    }
}
