//! The tool-call lifecycle: gate, capture, record.

use serde_json::{Value, json};
use tracing::debug;

use spindle_context::ContextUsage;
use spindle_core::{ErrorCode, ErrorObject, LedgerRowId, SessionId, ToolCallId, estimate_tokens};
use spindle_events::AppendEvent;
use spindle_ledger::{CompactOptions, LedgerAppend, Verdict};
use spindle_skills::AccessContext;

use crate::error::RuntimeResult;
use crate::runtime::{Runtime, SessionState, ToolCallEntry};

/// Lifecycle phase of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallPhase {
    /// Seen, not yet gated.
    Created,
    /// Passed the policy gate.
    Gated,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Rejected or finished with an error.
    Failed,
}

/// Input to [`Runtime::start_tool_call`].
#[derive(Debug, Clone)]
pub struct StartToolCall {
    /// Owning session.
    pub session_id: SessionId,
    /// The call's id; the key of its lifecycle.
    pub tool_call_id: ToolCallId,
    /// Tool name.
    pub tool_name: String,
    /// Tool arguments, verbatim.
    pub args: Value,
    /// Context usage at call time, when known.
    pub usage: Option<ContextUsage>,
    /// Whether to record a `tool_call` lifecycle event.
    pub record_lifecycle_event: bool,
}

/// Gate decision for one tool call.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Why not, when rejected.
    pub reason: Option<ErrorObject>,
    /// One-time policy warnings to surface to the agent.
    pub warnings: Vec<String>,
    /// Paths snapshotted for a mutation tool.
    pub tracked_paths: Vec<String>,
}

impl StartOutcome {
    fn rejected(reason: ErrorObject) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            warnings: Vec::new(),
            tracked_paths: Vec::new(),
        }
    }
}

/// Input to [`Runtime::finish_tool_call`].
#[derive(Debug, Clone)]
pub struct FinishToolCall {
    /// Owning session.
    pub session_id: SessionId,
    /// The call being finished.
    pub tool_call_id: ToolCallId,
    /// Tool name (echoed for callers that batch).
    pub tool_name: String,
    /// Short rendering of the arguments.
    pub args_summary: String,
    /// Full output text.
    pub output_text: String,
    /// Short rendering of the output.
    pub output_summary: String,
    /// Whether the tool reported success.
    pub success: bool,
    /// Evidence verdict for the ledger row.
    pub verdict: Verdict,
    /// Free-form metadata (touched files, exit codes).
    pub metadata: Option<Value>,
}

impl Runtime {
    /// Gate a tool call before execution.
    ///
    /// Runs the access policy chain, the compaction gate, skill
    /// accounting, and mutation snapshot capture, in that order. A
    /// rejection records the blocking event and leaves the call `Failed`.
    pub fn start_tool_call(&self, input: &StartToolCall) -> StartOutcome {
        let session_id = &input.session_id;
        let turn = self.current_turn(session_id);

        // 1. Usage observation; a newly armed gate is an event.
        if let Some(usage) = input.usage
            && self.context.observe_usage(session_id, usage)
        {
            self.emit(
                AppendEvent::new(session_id.clone(), "context_compaction_gate_armed")
                    .with_turn(turn)
                    .with_payload(json!({
                        "tokens": usage.tokens,
                        "contextWindow": usage.context_window,
                        "percent": usage.percent,
                    })),
            );
        }

        self.set_phase(session_id, &input.tool_call_id, &input.tool_name, ToolCallPhase::Created);

        // 2. Lifecycle event, when the caller wants one.
        if input.record_lifecycle_event {
            self.emit(
                AppendEvent::new(session_id.clone(), "tool_call")
                    .with_turn(turn)
                    .with_payload(json!({
                        "toolCallId": input.tool_call_id,
                        "toolName": input.tool_name,
                    })),
            );
        }

        // 3. Access policy chain.
        let active_skill = self
            .active_skill_name(session_id)
            .and_then(|name| self.skills.get(&name));
        let ctx = AccessContext {
            active_skill: active_skill.as_ref(),
            session_budget_blocked: self.cost.is_blocked(session_id),
        };
        let warnings = match self
            .access
            .check_tool_access(session_id, &input.tool_name, &ctx)
        {
            Ok(warnings) => warnings,
            Err(err) => {
                let reason = ErrorObject::from_error(&err);
                self.emit(
                    AppendEvent::new(session_id.clone(), "tool_call_blocked")
                        .with_turn(turn)
                        .with_payload(json!({
                            "toolCallId": input.tool_call_id,
                            "toolName": input.tool_name,
                            "reason": reason,
                        })),
                );
                self.set_phase(
                    session_id,
                    &input.tool_call_id,
                    &input.tool_name,
                    ToolCallPhase::Failed,
                );
                return StartOutcome::rejected(reason);
            },
        };
        for warning in &warnings {
            self.emit(
                AppendEvent::new(session_id.clone(), "tool_policy_warning")
                    .with_turn(turn)
                    .with_payload(json!({
                        "toolName": input.tool_name,
                        "kind": warning.kind,
                        "skill": warning.skill,
                        "message": warning.message,
                    })),
            );
        }

        // 4. Compaction gate.
        if let Err(err) = self.context.check_gate(session_id, &input.tool_name) {
            let reason = ErrorObject::from_error(&err);
            self.emit(
                AppendEvent::new(session_id.clone(), "context_compaction_gate_blocked_tool")
                    .with_turn(turn)
                    .with_payload(json!({
                        "toolCallId": input.tool_call_id,
                        "toolName": input.tool_name,
                    })),
            );
            self.set_phase(
                session_id,
                &input.tool_call_id,
                &input.tool_name,
                ToolCallPhase::Failed,
            );
            return StartOutcome::rejected(reason);
        }
        self.set_phase(session_id, &input.tool_call_id, &input.tool_name, ToolCallPhase::Gated);

        // 5. Accounting: per-skill counters and mutation tracking.
        if let Some(skill) = &active_skill {
            self.access.record_tool_call(session_id, &skill.name);
        }
        let mutation = self.patches.is_mutation_tool(&input.tool_name);
        if mutation {
            self.verify.note_mutation(session_id);
        }

        // 6. Snapshot files for mutation tools.
        let capture = self.patches.capture_before_tool_call(
            session_id,
            &input.tool_call_id,
            &input.tool_name,
            &input.args,
        );
        if capture.tracked_any() {
            self.emit(
                AppendEvent::new(session_id.clone(), "file_snapshot_captured")
                    .with_turn(turn)
                    .with_payload(json!({
                        "toolCallId": input.tool_call_id,
                        "paths": capture.tracked_paths,
                    })),
            );
        }

        self.mark_running(session_id, &input.tool_call_id);
        debug!(
            session = %session_id,
            tool = %input.tool_name,
            mutation,
            "tool call admitted"
        );
        StartOutcome {
            allowed: true,
            reason: None,
            warnings: warnings.into_iter().map(|w| w.message).collect(),
            tracked_paths: capture.tracked_paths,
        }
    }

    /// Record a finished tool call: ledger append, truth sync, evidence
    /// classification, lifecycle event, periodic ledger compaction, and
    /// patch-set completion.
    ///
    /// # Errors
    ///
    /// Returns an error when the ledger row cannot be persisted.
    pub fn finish_tool_call(&self, input: FinishToolCall) -> RuntimeResult<LedgerRowId> {
        let session_id = &input.session_id;
        let turn = self.current_turn(session_id);
        let skill = self.active_skill_name(session_id);

        // 1. The evidence row.
        let row = self.ledger.append(LedgerAppend {
            session_id: session_id.clone(),
            turn,
            skill: skill.clone(),
            tool: input.tool_name.clone(),
            args_summary: input.args_summary.clone(),
            output_summary: input.output_summary.clone(),
            full_output: input.output_text.clone(),
            verdict: input.verdict,
            metadata: input.metadata.clone(),
        })?;

        if let Some(skill) = &skill {
            self.access
                .record_tokens(session_id, skill, estimate_tokens(&input.output_text) as u64);
        }

        // 2. Truth sync from known diagnostic tools.
        self.sync_truth_from_result(session_id, &input, &row.id);

        // 3. Evidence classification.
        if let Some(kind) = Self::classify_evidence(&input.tool_name, input.verdict) {
            self.verify
                .record_evidence(session_id, kind, Some(row.id.to_string()));
        }

        // 4. Lifecycle event.
        self.emit(
            AppendEvent::new(session_id.clone(), "tool_result_recorded")
                .with_turn(turn)
                .with_payload(json!({
                    "toolCallId": input.tool_call_id,
                    "toolName": input.tool_name,
                    "verdict": input.verdict,
                    "success": input.success,
                    "ledgerId": row.id,
                })),
        );

        // 5. Periodic ledger compaction.
        self.maybe_compact_ledger(session_id, turn);

        // 6. Patch-set completion for mutation tools.
        if let Some(patch) =
            self.patches
                .complete_tool_call(session_id, &input.tool_call_id, input.success)
        {
            self.emit(
                AppendEvent::new(session_id.clone(), "patch_recorded")
                    .with_turn(turn)
                    .with_payload(json!({
                        "patchSetId": patch.id,
                        "toolCallId": input.tool_call_id,
                        "changes": patch.changes.iter().map(|c| json!({
                            "path": c.path,
                            "action": c.action,
                        })).collect::<Vec<_>>(),
                    })),
            );
        }

        // A successful compaction clears the gate.
        if input.tool_name == "session_compact" && input.success {
            self.context.mark_compacted(session_id);
            self.emit(
                AppendEvent::new(session_id.clone(), "context_compacted")
                    .with_turn(turn)
                    .with_payload(json!({"ledgerId": row.id})),
            );
        }

        self.maybe_checkpoint_tape(session_id);
        self.set_finished(session_id, &input.tool_call_id, input.success);
        Ok(row.id)
    }

    /// The lifecycle phase of a tool call, if known.
    #[must_use]
    pub fn tool_call_phase(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
    ) -> Option<ToolCallPhase> {
        self.lock_sessions()
            .get(session_id)
            .and_then(|s| s.tool_calls.get(tool_call_id))
            .map(|entry| entry.phase)
    }

    fn maybe_compact_ledger(&self, session_id: &SessionId, turn: u64) {
        let every = self.config.ledger.checkpoint_every_turns;
        if every == 0 || turn == 0 || turn % every != 0 {
            return;
        }
        {
            let mut sessions = self.lock_sessions();
            let session = sessions.entry(session_id.clone()).or_default();
            if session.last_ledger_compaction_turn == Some(turn) {
                return;
            }
            session.last_ledger_compaction_turn = Some(turn);
        }

        let keep = self.config.ledger.digest_window;
        match self.ledger.compact_session(
            session_id,
            &CompactOptions {
                keep_last: keep,
                reason: format!("turn {turn} cadence"),
            },
        ) {
            Ok(Some(checkpoint)) => {
                self.emit(
                    AppendEvent::new(session_id.clone(), "ledger_compacted")
                        .with_turn(turn)
                        .with_payload(json!({
                            "checkpointId": checkpoint.id,
                            "keepLast": keep,
                        })),
                );
            },
            Ok(None) => {},
            Err(err) => {
                self.emit(
                    AppendEvent::new(session_id.clone(), "ledger_compaction_failed")
                        .with_turn(turn)
                        .with_payload(json!({"error": err.to_string(), "code": err.code()})),
                );
            },
        }
    }

    fn maybe_checkpoint_tape(&self, session_id: &SessionId) {
        let interval = self.config.tape.checkpoint_interval_entries;
        if interval == 0 {
            return;
        }
        let thresholds = crate::config_bridge::tape_thresholds(&self.config);
        let status = self.replay.tape_status(session_id, &thresholds);
        if status.entries_since_checkpoint >= interval
            && let Err(err) = self.record_checkpoint(session_id)
        {
            debug!(session = %session_id, error = %err, "auto checkpoint failed");
        }
    }

    fn set_phase(
        &self,
        session_id: &SessionId,
        tool_call_id: &ToolCallId,
        tool_name: &str,
        phase: ToolCallPhase,
    ) {
        let mut sessions = self.lock_sessions();
        let session: &mut SessionState = sessions.entry(session_id.clone()).or_default();
        session
            .tool_calls
            .entry(tool_call_id.clone())
            .and_modify(|entry| entry.phase = phase)
            .or_insert_with(|| ToolCallEntry {
                phase,
                tool_name: tool_name.to_owned(),
            });
    }

    fn mark_running(&self, session_id: &SessionId, tool_call_id: &ToolCallId) {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions
            .get_mut(session_id)
            .and_then(|s| s.tool_calls.get_mut(tool_call_id))
        {
            entry.phase = ToolCallPhase::Running;
        }
    }

    fn set_finished(&self, session_id: &SessionId, tool_call_id: &ToolCallId, success: bool) {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions
            .get_mut(session_id)
            .and_then(|s| s.tool_calls.get_mut(tool_call_id))
        {
            entry.phase = if success {
                ToolCallPhase::Completed
            } else {
                ToolCallPhase::Failed
            };
            debug!(tool = %entry.tool_name, success, "tool call finished");
        }
    }
}
