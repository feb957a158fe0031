//! The verification gate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use spindle_core::{SessionId, TimestampMs, now_ms};

use crate::runner::run_check;

/// Verification depth (mirrors the config section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Evidence-only; no commands run.
    Quick,
    /// Runs the configured standard checks.
    Standard,
    /// Standard plus the thorough checks.
    Thorough,
}

impl VerifyLevel {
    /// Canonical name, the key into the checks map.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
        }
    }
}

/// Evidence kinds classified from tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Diagnostics came back clean.
    LspClean,
    /// A test or build run passed.
    TestOrBuildPassed,
    /// The change was reviewed against the task spec.
    SpecReviewed,
}

impl EvidenceKind {
    /// Evidence required for a level.
    #[must_use]
    pub fn required_for(level: VerifyLevel) -> &'static [EvidenceKind] {
        match level {
            VerifyLevel::Quick => &[],
            VerifyLevel::Standard => &[EvidenceKind::LspClean],
            VerifyLevel::Thorough => {
                &[EvidenceKind::LspClean, EvidenceKind::TestOrBuildPassed]
            },
        }
    }

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LspClean => "lsp_clean",
            Self::TestOrBuildPassed => "test_or_build_passed",
            Self::SpecReviewed => "spec_reviewed",
        }
    }
}

/// One piece of classified evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceRecord {
    /// What kind of evidence.
    pub kind: EvidenceKind,
    /// When it was recorded.
    pub at: TimestampMs,
    /// The ledger row it came from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_id: Option<String>,
}

/// One cached check run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRun {
    /// When the run finished.
    pub timestamp: TimestampMs,
    /// Whether it passed.
    pub ok: bool,
    /// The command that ran.
    pub command: String,
    /// Exit code, when the process completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// True when the hard timeout expired.
    pub timed_out: bool,
    /// Ledger row recording the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_id: Option<String>,
    /// Trailing output slice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
}

/// Status of one required check within an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatus {
    /// Check name.
    pub name: String,
    /// Whether the cached run passed.
    pub ok: bool,
    /// Whether the cached run postdates the last mutation.
    pub fresh: bool,
    /// The cached run's timestamp, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampMs>,
}

/// Result of evaluating a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// True when all evidence is present and all checks pass fresh.
    pub passed: bool,
    /// Evidence kinds still missing.
    pub missing_evidence: Vec<String>,
    /// Per-check status.
    pub checks: Vec<CheckStatus>,
}

/// A blocker/truth synchronization action for the orchestrator to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockerSyncAction {
    /// Upsert `verifier:<check>` blocker and `truth:verifier:<check>` fact.
    Upsert {
        /// Check name.
        check: String,
        /// Failure message.
        message: String,
    },
    /// Resolve both.
    Resolve {
        /// Check name.
        check: String,
    },
}

/// Gate configuration (mirrors the config section).
#[derive(Debug, Clone, Default)]
pub struct VerifyConfig {
    /// Check names required per level name.
    pub checks: HashMap<String, Vec<String>>,
    /// Shell command per check name.
    pub commands: HashMap<String, String>,
    /// Hard timeout per command.
    pub timeout_ms: u64,
}

#[derive(Default)]
struct SessionVerification {
    last_write_at: Option<TimestampMs>,
    evidence: Vec<EvidenceRecord>,
    check_runs: HashMap<String, CheckRun>,
    denial_count: u32,
    synced_failing: HashSet<String>,
}

/// Per-session verification state and check execution.
pub struct VerificationGate {
    workspace_root: PathBuf,
    config: VerifyConfig,
    sessions: Mutex<HashMap<SessionId, SessionVerification>>,
}

impl VerificationGate {
    /// Create a gate for a workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>, config: VerifyConfig) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record that a mutation tool call happened; stales cached checks.
    pub fn note_mutation(&self, session_id: &SessionId) {
        let mut sessions = self.lock();
        sessions.entry(session_id.clone()).or_default().last_write_at = Some(now_ms());
    }

    /// Record classified evidence from a tool result.
    pub fn record_evidence(
        &self,
        session_id: &SessionId,
        kind: EvidenceKind,
        ledger_id: Option<String>,
    ) {
        let mut sessions = self.lock();
        sessions
            .entry(session_id.clone())
            .or_default()
            .evidence
            .push(EvidenceRecord {
                kind,
                at: now_ms(),
                ledger_id,
            });
    }

    /// Count a completion denial (the agent claimed done; the gate said no).
    pub fn record_denial(&self, session_id: &SessionId) -> u32 {
        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        session.denial_count += 1;
        session.denial_count
    }

    /// Evaluate a level against cached evidence and check runs.
    #[must_use]
    pub fn evaluate(&self, session_id: &SessionId, level: VerifyLevel) -> Evaluation {
        let sessions = self.lock();
        let session = sessions.get(session_id);
        let last_write = session.and_then(|s| s.last_write_at);

        let missing_evidence: Vec<String> = EvidenceKind::required_for(level)
            .iter()
            .filter(|kind| {
                let fresh = session.is_some_and(|s| {
                    s.evidence.iter().any(|e| {
                        e.kind == **kind && last_write.is_none_or(|w| e.at >= w)
                    })
                });
                !fresh
            })
            .map(|kind| kind.as_str().to_owned())
            .collect();

        let checks: Vec<CheckStatus> = self
            .required_checks(level)
            .into_iter()
            .map(|name| {
                let run = session.and_then(|s| s.check_runs.get(&name));
                CheckStatus {
                    ok: run.is_some_and(|r| r.ok),
                    fresh: run
                        .is_some_and(|r| last_write.is_none_or(|w| r.timestamp >= w)),
                    timestamp: run.map(|r| r.timestamp),
                    name,
                }
            })
            .collect();

        let passed =
            missing_evidence.is_empty() && checks.iter().all(|c| c.ok && c.fresh);
        Evaluation {
            passed,
            missing_evidence,
            checks,
        }
    }

    /// Run missing or stale checks, cache results, and re-evaluate.
    ///
    /// At `Quick` level (or with `execute_commands` off) nothing runs;
    /// the cached state is evaluated as-is.
    pub async fn verify_completion(
        &self,
        session_id: &SessionId,
        level: VerifyLevel,
        execute_commands: bool,
    ) -> Evaluation {
        if execute_commands && level != VerifyLevel::Quick {
            let stale: Vec<String> = {
                let evaluation = self.evaluate(session_id, level);
                evaluation
                    .checks
                    .iter()
                    .filter(|c| !c.ok || !c.fresh)
                    .map(|c| c.name.clone())
                    .collect()
            };

            for name in stale {
                let Some(command) = self.config.commands.get(&name).cloned() else {
                    debug!(check = %name, "no command configured, skipping");
                    continue;
                };
                let outcome =
                    run_check(&self.workspace_root, &command, self.config.timeout_ms).await;
                info!(check = %name, ok = outcome.ok, "verification check finished");
                let mut sessions = self.lock();
                sessions
                    .entry(session_id.clone())
                    .or_default()
                    .check_runs
                    .insert(
                        name,
                        CheckRun {
                            timestamp: now_ms(),
                            ok: outcome.ok,
                            command,
                            exit_code: outcome.exit_code,
                            duration_ms: outcome.duration_ms,
                            timed_out: outcome.timed_out,
                            ledger_id: None,
                            output_summary: Some(outcome.output_summary),
                        },
                    );
            }
        }

        let evaluation = self.evaluate(session_id, level);
        if !evaluation.passed {
            self.record_denial(session_id);
        }
        evaluation
    }

    /// Compute blocker synchronization actions from cached check runs.
    ///
    /// Failing checks produce `Upsert`; checks previously synced as
    /// failing that now pass produce `Resolve`. Idempotent between state
    /// changes: a second call with no new runs returns only re-upserts
    /// for still-failing checks.
    #[must_use]
    pub fn sync_verification_blockers(&self, session_id: &SessionId) -> Vec<BlockerSyncAction> {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        let mut names: Vec<&String> = session.check_runs.keys().collect();
        names.sort();
        let names: Vec<String> = names.into_iter().cloned().collect();

        for name in names {
            let run = &session.check_runs[&name];
            if run.ok {
                if session.synced_failing.remove(&name) {
                    actions.push(BlockerSyncAction::Resolve {
                        check: name.clone(),
                    });
                }
            } else {
                session.synced_failing.insert(name.clone());
                let message = run
                    .output_summary
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("check '{name}' failing"));
                actions.push(BlockerSyncAction::Upsert {
                    check: name,
                    message,
                });
            }
        }
        actions
    }

    /// A session's cached check run, if any.
    #[must_use]
    pub fn check_run(&self, session_id: &SessionId, check: &str) -> Option<CheckRun> {
        self.lock()
            .get(session_id)
            .and_then(|s| s.check_runs.get(check))
            .cloned()
    }

    /// Drop all per-session state (teardown).
    pub fn clear_session(&self, session_id: &SessionId) {
        self.lock().remove(session_id);
    }

    fn required_checks(&self, level: VerifyLevel) -> Vec<String> {
        let mut names = self
            .config
            .checks
            .get(level.as_str())
            .cloned()
            .unwrap_or_default();
        // Thorough implies everything standard requires.
        if level == VerifyLevel::Thorough
            && let Some(standard) = self.config.checks.get(VerifyLevel::Standard.as_str())
        {
            for check in standard {
                if !names.contains(check) {
                    names.insert(0, check.clone());
                }
            }
        }
        names
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionVerification>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for VerificationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationGate")
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(commands: &[(&str, &str)]) -> VerifyConfig {
        let mut checks = HashMap::new();
        checks.insert(
            "standard".to_owned(),
            commands.iter().map(|(n, _)| (*n).to_owned()).collect(),
        );
        VerifyConfig {
            checks,
            commands: commands
                .iter()
                .map(|(n, c)| ((*n).to_owned(), (*c).to_owned()))
                .collect(),
            timeout_ms: 5_000,
        }
    }

    fn gate(commands: &[(&str, &str)]) -> VerificationGate {
        VerificationGate::new(std::env::temp_dir(), config(commands))
    }

    #[tokio::test]
    async fn test_quick_level_runs_nothing() {
        let gate = gate(&[("type-check", "exit 1")]);
        let evaluation = gate
            .verify_completion(&"s1".into(), VerifyLevel::Quick, true)
            .await;
        // Quick has no required evidence or checks.
        assert!(evaluation.passed);
        assert!(gate.check_run(&"s1".into(), "type-check").is_none());
    }

    #[tokio::test]
    async fn test_failing_check_then_fix() {
        let gate = gate(&[("type-check", "exit 2")]);
        gate.record_evidence(&"s1".into(), EvidenceKind::LspClean, None);

        let evaluation = gate
            .verify_completion(&"s1".into(), VerifyLevel::Standard, true)
            .await;
        assert!(!evaluation.passed);
        let run = gate.check_run(&"s1".into(), "type-check").unwrap();
        assert_eq!(run.exit_code, Some(2));

        let actions = gate.sync_verification_blockers(&"s1".into());
        assert!(matches!(
            actions[0],
            BlockerSyncAction::Upsert { ref check, .. } if check == "type-check"
        ));

        // "Fix" the check by swapping the cached run for a passing one.
        {
            let mut sessions = gate.sessions.lock().unwrap();
            let session = sessions.get_mut(&"s1".into()).unwrap();
            let run = session.check_runs.get_mut("type-check").unwrap();
            run.ok = true;
            run.exit_code = Some(0);
        }
        let actions = gate.sync_verification_blockers(&"s1".into());
        assert_eq!(
            actions,
            vec![BlockerSyncAction::Resolve {
                check: "type-check".to_owned()
            }]
        );
        // Resolving is not repeated.
        assert!(gate.sync_verification_blockers(&"s1".into()).is_empty());
    }

    #[tokio::test]
    async fn test_mutation_stales_cached_run() {
        let gate = gate(&[("type-check", "true")]);
        gate.record_evidence(&"s1".into(), EvidenceKind::LspClean, None);

        let evaluation = gate
            .verify_completion(&"s1".into(), VerifyLevel::Standard, true)
            .await;
        assert!(evaluation.passed);

        std::thread::sleep(std::time::Duration::from_millis(5));
        gate.note_mutation(&"s1".into());
        let evaluation = gate.evaluate(&"s1".into(), VerifyLevel::Standard);
        assert!(!evaluation.passed);
        assert!(!evaluation.checks[0].fresh);
    }

    #[tokio::test]
    async fn test_missing_evidence_reported() {
        let gate = gate(&[]);
        let evaluation = gate.evaluate(&"s1".into(), VerifyLevel::Standard);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.missing_evidence, vec!["lsp_clean".to_owned()]);
    }

    #[tokio::test]
    async fn test_denial_counting() {
        let gate = gate(&[]);
        let evaluation = gate
            .verify_completion(&"s1".into(), VerifyLevel::Standard, false)
            .await;
        assert!(!evaluation.passed);
        assert_eq!(gate.record_denial(&"s1".into()), 2);
    }
}
