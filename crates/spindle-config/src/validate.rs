//! Configuration validation.
//!
//! Spindle treats configuration problems as warnings wherever a safe
//! default exists; the runtime keeps going with the configured value
//! clamped at use sites.

use crate::types::Config;

/// Validate a configuration, returning human-readable warnings.
#[must_use]
pub fn validate(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    let cb = &config.infrastructure.context_budget;
    if !(0.0..=1.0).contains(&cb.compaction_threshold_percent) {
        warnings.push(format!(
            "infrastructure.contextBudget.compactionThresholdPercent {} outside 0..1",
            cb.compaction_threshold_percent
        ));
    }
    if !(0.0..=1.0).contains(&cb.hard_limit_percent) {
        warnings.push(format!(
            "infrastructure.contextBudget.hardLimitPercent {} outside 0..1",
            cb.hard_limit_percent
        ));
    }
    if cb.hard_limit_percent < cb.compaction_threshold_percent {
        warnings.push(
            "infrastructure.contextBudget.hardLimitPercent below compactionThresholdPercent"
                .to_owned(),
        );
    }

    if config.schedule.min_interval_ms < 1000 {
        warnings.push(format!(
            "schedule.minIntervalMs {} below the recommended 1s minimum",
            config.schedule.min_interval_ms
        ));
    }
    if config.schedule.lease_duration_ms <= 0 {
        warnings.push("schedule.leaseDurationMs must be positive".to_owned());
    }
    if config.schedule.max_recovery_catch_ups == 0 {
        warnings.push("schedule.maxRecoveryCatchUps of 0 defers every missed fire".to_owned());
    }

    if config.ledger.digest_window == 0 {
        warnings.push("ledger.digestWindow of 0 produces an empty digest".to_owned());
    }

    let t = &config.tape.tape_pressure_thresholds;
    if !(t.low <= t.medium && t.medium <= t.high) {
        warnings.push("tape.tapePressureThresholds must be ordered low <= medium <= high".to_owned());
    }

    for (level, checks) in &config.verification.checks {
        for check in checks {
            if !config.verification.commands.contains_key(check) {
                warnings.push(format!(
                    "verification.checks[{level}] names '{check}' with no configured command"
                ));
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_warns_only_about_commands() {
        // Defaults reference type-check/test without commands; that is the
        // one expected warning family out of the box.
        let warnings = validate(&Config::default());
        assert!(warnings.iter().all(|w| w.contains("no configured command")));
    }

    #[test]
    fn test_bad_ratio_is_flagged() {
        let mut cfg = Config::default();
        cfg.infrastructure.context_budget.hard_limit_percent = 1.5;
        let warnings = validate(&cfg);
        assert!(warnings.iter().any(|w| w.contains("hardLimitPercent")));
    }

    #[test]
    fn test_short_interval_is_flagged() {
        let mut cfg = Config::default();
        cfg.schedule.min_interval_ms = 10;
        let warnings = validate(&cfg);
        assert!(warnings.iter().any(|w| w.contains("minIntervalMs")));
    }

    #[test]
    fn test_unordered_tape_thresholds_flagged() {
        let mut cfg = Config::default();
        cfg.tape.tape_pressure_thresholds.low = 500;
        let warnings = validate(&cfg);
        assert!(warnings.iter().any(|w| w.contains("tapePressureThresholds")));
    }
}
