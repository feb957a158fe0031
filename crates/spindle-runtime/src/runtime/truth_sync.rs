//! Truth synchronization from tool results and verification runs.

use serde_json::json;
use tracing::info;

use spindle_core::{LedgerRowId, SessionId};
use spindle_events::AppendEvent;
use spindle_ledger::Verdict;
use spindle_verify::{BlockerSyncAction, Evaluation, EvidenceKind, VerifyLevel};

use crate::runtime::Runtime;
use crate::runtime::tool_calls::FinishToolCall;

/// Tools whose results carry a truth signal worth projecting.
const DIAGNOSTIC_TOOLS: &[&str] = &["lsp_diagnostics", "type_check", "test", "build", "lint"];

impl Runtime {
    /// Turn a known tool's result into truth ledger events.
    ///
    /// A failing diagnostic upserts `truth:tool:<tool>`; a passing one
    /// resolves it if present. Other tools leave truth alone.
    pub(crate) fn sync_truth_from_result(
        &self,
        session_id: &SessionId,
        input: &FinishToolCall,
        ledger_id: &LedgerRowId,
    ) {
        if !DIAGNOSTIC_TOOLS.contains(&input.tool_name.as_str()) {
            return;
        }
        let fact_id = format!("truth:tool:{}", input.tool_name);

        match input.verdict {
            Verdict::Fail => {
                self.emit(
                    AppendEvent::new(session_id.clone(), "truth_ledger:fact_upserted")
                        .with_payload(json!({
                            "id": fact_id,
                            "kind": "tool_signal",
                            "severity": "warn",
                            "summary": input.output_summary,
                            "evidenceIds": [ledger_id],
                        })),
                );
            },
            Verdict::Pass => {
                let truth = self.replay.truth_state(session_id);
                if truth
                    .fact(&fact_id)
                    .is_some_and(|f| f.status == spindle_replay::FactStatus::Active)
                {
                    self.emit(
                        AppendEvent::new(session_id.clone(), "truth_ledger:fact_resolved")
                            .with_payload(json!({"id": fact_id})),
                    );
                }
            },
            Verdict::Inconclusive => {},
        }
    }

    /// Evidence classification for the verification gate.
    pub(crate) fn classify_evidence(tool_name: &str, verdict: Verdict) -> Option<EvidenceKind> {
        if verdict != Verdict::Pass {
            return None;
        }
        match tool_name {
            "lsp_diagnostics" | "type_check" | "lint" => Some(EvidenceKind::LspClean),
            "test" | "build" => Some(EvidenceKind::TestOrBuildPassed),
            _ => None,
        }
    }

    /// Run missing/stale checks at a level, synchronize failing checks
    /// into task blockers and truth facts, and record the evaluation.
    pub async fn verify_completion(
        &self,
        session_id: &SessionId,
        level: VerifyLevel,
        execute_commands: bool,
    ) -> Evaluation {
        let evaluation = self
            .verify
            .verify_completion(session_id, level, execute_commands)
            .await;

        self.sync_verification_blockers(session_id);

        let turn = self.current_turn(session_id);
        self.emit(
            AppendEvent::new(session_id.clone(), "verification_completed")
                .with_turn(turn)
                .with_payload(json!({
                    "level": level.as_str(),
                    "passed": evaluation.passed,
                    "missingEvidence": evaluation.missing_evidence,
                    "checks": evaluation.checks,
                })),
        );
        info!(
            session = %session_id,
            level = level.as_str(),
            passed = evaluation.passed,
            "verification completed"
        );
        evaluation
    }

    /// Project the gate's cached check runs into blockers and facts.
    ///
    /// For each failing check: upsert `truth:verifier:<check>` and the
    /// `verifier:<check>` task blocker. A previously failing check that
    /// now passes resolves both on the same turn.
    pub fn sync_verification_blockers(&self, session_id: &SessionId) {
        for action in self.verify.sync_verification_blockers(session_id) {
            match action {
                BlockerSyncAction::Upsert { check, message } => {
                    let fact_id = format!("truth:verifier:{check}");
                    self.emit(
                        AppendEvent::new(session_id.clone(), "truth_ledger:fact_upserted")
                            .with_payload(json!({
                                "id": fact_id,
                                "kind": "verifier",
                                "severity": "error",
                                "summary": message,
                            })),
                    );
                    self.emit(
                        AppendEvent::new(session_id.clone(), "task_ledger:blocker_added")
                            .with_payload(json!({
                                "id": format!("verifier:{check}"),
                                "message": message,
                                "source": format!("verifier:{check}"),
                                "truthFactId": fact_id,
                            })),
                    );
                },
                BlockerSyncAction::Resolve { check } => {
                    self.emit(
                        AppendEvent::new(session_id.clone(), "truth_ledger:fact_resolved")
                            .with_payload(json!({"id": format!("truth:verifier:{check}")})),
                    );
                    self.emit(
                        AppendEvent::new(session_id.clone(), "task_ledger:blocker_resolved")
                            .with_payload(json!({"id": format!("verifier:{check}")})),
                    );
                },
            }
        }
    }
}
