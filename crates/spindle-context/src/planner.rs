//! The context injection planner.
//!
//! Assembles the hidden block injected before each agent turn. Sections
//! are gathered in priority order (truth, task, tape anchor, viewport,
//! skills, ledger digest, memory handoff), each under a proportional share
//! of the injection budget, then combined, fingerprinted, and deduplicated
//! per (session, scope) so parallel branches never double-inject.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use spindle_core::{ContentHash, SessionId, estimate_tokens};
use spindle_events::{AppendEvent, EventError, EventFilter, EventStore};
use spindle_ledger::{DigestOptions, LedgerStore};
use spindle_replay::{ReplayEngine, TapeThresholds, TaskHealth, TaskPhase, TaskState, TaskStatus};
use spindle_skills::SkillRegistry;

use crate::budget::{ContextBudget, ContextPressure, ContextUsage};

/// Planner tuning.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Whether prompts are sanitized before scoring and assembly.
    pub sanitize: bool,
    /// How many skill candidates to surface.
    pub top_k_skills: usize,
    /// Ledger digest window (rows).
    pub digest_window: usize,
    /// Ledger digest token budget.
    pub digest_max_tokens: usize,
    /// Tape pressure thresholds.
    pub tape_thresholds: TapeThresholds,
    /// Instructions shown when the compaction gate is in force.
    pub compaction_instructions: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            sanitize: true,
            top_k_skills: 3,
            digest_window: 12,
            digest_max_tokens: 600,
            tape_thresholds: TapeThresholds {
                low: 40,
                medium: 120,
                high: 250,
            },
            compaction_instructions:
                "Summarize completed work, keep open blockers and next steps.".to_owned(),
        }
    }
}

/// Input to one planning pass.
#[derive(Debug, Clone)]
pub struct PlanInput {
    /// The session being served.
    pub session_id: SessionId,
    /// The prompt about to be sent.
    pub prompt: String,
    /// Current usage, when the caller has one.
    pub usage: Option<ContextUsage>,
    /// Branch scope for parallel fan-out; `None` is the root scope.
    pub scope: Option<String>,
    /// Whether the last verification pass failed.
    pub verification_failed: bool,
    /// A memory handoff block, when one exists.
    pub memory_handoff: Option<String>,
}

/// What the planner produced.
#[derive(Debug, Clone)]
pub struct InjectionOutcome {
    /// False when the block was dropped (dedup, hard limit, empty).
    pub accepted: bool,
    /// The hidden context block.
    pub text: String,
    /// Token estimate of `text`.
    pub tokens: usize,
    /// Whether the block was truncated to fit.
    pub truncated: bool,
    /// Whether a `task_ledger:status_set` event was emitted.
    pub status_changed: bool,
    /// Why the block was dropped, when it was.
    pub dropped_reason: Option<String>,
}

/// Proportional per-source shares of the injection budget.
const SHARE_TRUTH: f64 = 0.25;
const SHARE_TASK: f64 = 0.20;
const SHARE_TAPE: f64 = 0.10;
const SHARE_VIEWPORT: f64 = 0.10;
const SHARE_SKILLS: f64 = 0.10;
const SHARE_DIGEST: f64 = 0.15;
const SHARE_MEMORY: f64 = 0.10;

/// Assembles priority-ordered, token-budgeted context blocks.
pub struct InjectionPlanner {
    config: PlannerConfig,
    events: Arc<EventStore>,
    replay: Arc<ReplayEngine>,
    ledger: Arc<LedgerStore>,
    skills: Arc<SkillRegistry>,
    budget: Arc<ContextBudget>,
}

impl InjectionPlanner {
    /// Wire a planner over the shared subsystems.
    #[must_use]
    pub fn new(
        config: PlannerConfig,
        events: Arc<EventStore>,
        replay: Arc<ReplayEngine>,
        ledger: Arc<LedgerStore>,
        skills: Arc<SkillRegistry>,
        budget: Arc<ContextBudget>,
    ) -> Self {
        Self {
            config,
            events,
            replay,
            ledger,
            skills,
            budget,
        }
    }

    /// Plan the hidden context block for one agent turn.
    #[must_use]
    pub fn plan(&self, input: &PlanInput) -> InjectionOutcome {
        let session_id = &input.session_id;

        // 1. Sanitize the prompt.
        let prompt = if self.config.sanitize {
            sanitize(&input.prompt)
        } else {
            input.prompt.clone()
        };

        // 2. Observe usage; an observation that newly arms the gate is
        // recorded as an event.
        if let Some(usage) = input.usage
            && self.budget.observe_usage(session_id, usage)
        {
            self.emit(
                AppendEvent::new(session_id.clone(), "context_compaction_gate_armed")
                    .with_payload(json!({
                        "tokens": usage.tokens,
                        "contextWindow": usage.context_window,
                        "percent": usage.percent,
                    })),
            );
        }
        let pressure = self.budget.pressure(session_id);

        // 3. Align task status; sections reflect the aligned state.
        let mut projection = self.replay.projection(session_id);
        let status_changed = self.align_status(
            session_id,
            &projection.task,
            input.verification_failed,
            pressure,
        );
        if status_changed {
            projection = self.replay.projection(session_id);
        }

        // 4. Assemble sections under per-source caps.
        let degraded = self.output_health_degraded(session_id);
        let max = self.budget.config().max_injection_tokens;
        let mut sections: Vec<String> = Vec::new();

        if pressure == ContextPressure::Critical {
            sections.push(format!(
                "[ContextCompactionGate]\n{}",
                self.config.compaction_instructions
            ));
        }

        let truth_block = render_truth(&projection.truth, cap(max, SHARE_TRUTH));
        if !truth_block.is_empty() {
            sections.push(format!("[Truth]\n{truth_block}"));
        }

        let task_block = render_task(&projection.task, cap(max, SHARE_TASK));
        if !task_block.is_empty() {
            sections.push(format!("[Task]\n{task_block}"));
        }

        if !degraded {
            let tape = self
                .replay
                .tape_status(session_id, &self.config.tape_thresholds);
            if let Some(anchor) = &tape.last_anchor {
                let block = clamp_tokens(
                    &format!(
                        "anchor: {}: {}\nnext: {}\nentries since: {}",
                        anchor.name, anchor.summary, anchor.next_steps, tape.entries_since_anchor
                    ),
                    cap(max, SHARE_TAPE),
                );
                sections.push(format!("[Anchor]\n{block}"));
            }

            if let Some(spec) = &projection.task.spec
                && !spec.target_files.is_empty()
            {
                let block =
                    clamp_tokens(&spec.target_files.join("\n"), cap(max, SHARE_VIEWPORT));
                sections.push(format!("[Viewport]\n{block}"));
            }

            let candidates = self.skills.select_top_k(&prompt, self.config.top_k_skills);
            if !candidates.is_empty() {
                let block = clamp_tokens(
                    &candidates
                        .iter()
                        .map(|c| format!("{} (score {}): {}", c.name, c.score, c.description))
                        .collect::<Vec<_>>()
                        .join("\n"),
                    cap(max, SHARE_SKILLS),
                );
                sections.push(format!("[Skills]\n{block}"));
            }

            let digest = self.ledger.build_digest(
                session_id,
                &DigestOptions {
                    window: self.config.digest_window,
                    max_tokens: cap(max, SHARE_DIGEST),
                },
            );
            if !digest.is_empty() {
                sections.push(format!("[Ledger]\n{digest}"));
            }

            if let Some(memory) = &input.memory_handoff {
                let block = clamp_tokens(memory, cap(max, SHARE_MEMORY));
                sections.push(format!("[Memory]\n{block}"));
            }
        }

        if sections.is_empty() {
            return InjectionOutcome {
                accepted: false,
                text: String::new(),
                tokens: 0,
                truncated: false,
                status_changed,
                dropped_reason: Some("empty".to_owned()),
            };
        }

        // 5. Combine, fingerprint, dedup per (session, scope).
        let combined = sections.join("\n\n");
        let fingerprint = ContentHash::hash_with_domain("context-injection", combined.as_bytes());
        if self.budget.last_fingerprint(session_id, input.scope.as_deref()) == Some(fingerprint) {
            debug!(session = %session_id, scope = ?input.scope, "duplicate injection dropped");
            return InjectionOutcome {
                accepted: false,
                text: String::new(),
                tokens: 0,
                truncated: false,
                status_changed,
                dropped_reason: Some("duplicate".to_owned()),
            };
        }

        // 6. Fit to the window, reserve against the scope's pool.
        let plan = self.budget.plan_injection(session_id, &combined, input.usage);
        if !plan.accepted {
            return InjectionOutcome {
                accepted: false,
                text: String::new(),
                tokens: 0,
                truncated: false,
                status_changed,
                dropped_reason: plan.dropped_reason,
            };
        }

        let granted =
            self.budget
                .reserve(session_id, input.scope.as_deref(), plan.final_tokens);
        if granted == 0 {
            return InjectionOutcome {
                accepted: false,
                text: String::new(),
                tokens: 0,
                truncated: false,
                status_changed,
                dropped_reason: Some("injection_budget_exhausted".to_owned()),
            };
        }
        let (text, truncated) = if granted < plan.final_tokens {
            (clamp_tokens(&plan.final_text, granted), true)
        } else {
            (plan.final_text.clone(), plan.truncated)
        };

        self.budget
            .set_fingerprint(session_id, input.scope.as_deref(), fingerprint);

        InjectionOutcome {
            tokens: estimate_tokens(&text),
            accepted: true,
            text,
            truncated,
            status_changed,
            dropped_reason: None,
        }
    }

    /// Compute a fresh task status and emit `status_set` only on change.
    fn align_status(
        &self,
        session_id: &SessionId,
        task: &TaskState,
        verification_failed: bool,
        pressure: ContextPressure,
    ) -> bool {
        let verification_failed = verification_failed
            || task.blockers.iter().any(|b| b.source.starts_with("verifier"));
        let health = if verification_failed {
            TaskHealth::VerificationFailed
        } else if !task.blockers.is_empty() {
            TaskHealth::Blocked
        } else if task.spec.is_none() {
            TaskHealth::NeedsSpec
        } else if pressure >= ContextPressure::High && pressure != ContextPressure::Unknown {
            TaskHealth::BudgetPressure
        } else {
            TaskHealth::Ok
        };

        let phase = if task.spec.is_none() {
            TaskPhase::Align
        } else if !task.blockers.is_empty() {
            TaskPhase::Blocked
        } else {
            task.status.phase
        };

        let fresh = TaskStatus {
            phase,
            health,
            reason: match health {
                TaskHealth::Blocked => Some(format!("{} open blocker(s)", task.blockers.len())),
                TaskHealth::VerificationFailed => Some("verification failing".to_owned()),
                TaskHealth::NeedsSpec => Some("no task spec".to_owned()),
                TaskHealth::BudgetPressure => Some("context budget pressure".to_owned()),
                _ => None,
            },
            truth_fact_ids: task
                .blockers
                .iter()
                .filter_map(|b| b.truth_fact_id.clone())
                .collect(),
        };

        if fresh == task.status {
            return false;
        }
        let payload = match serde_json::to_value(&fresh) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "status payload encode failed");
                return false;
            },
        };
        self.emit(
            AppendEvent::new(session_id.clone(), "task_ledger:status_set").with_payload(payload),
        );
        true
    }

    /// Peek the latest output-health report and decide whether to slim the
    /// injection down to critical sections.
    fn output_health_degraded(&self, session_id: &SessionId) -> bool {
        let last = self.events.list(
            session_id,
            &EventFilter {
                event_type: Some("message_update".to_owned()),
                last: Some(1),
            },
        );
        let Some(record) = last.first() else {
            return false;
        };
        let Some(health) = record.payload.as_ref().and_then(|p| p.get("health")) else {
            return false;
        };
        let drunk = health
            .get("drunk")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let score = health
            .get("score")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(1.0);
        drunk || score < 0.5
    }

    fn emit(&self, event: AppendEvent) {
        match self.events.append(event) {
            Ok(_) | Err(EventError::StoreDisabled) => {},
            Err(err) => warn!(error = %err, "planner event append failed"),
        }
    }
}

impl std::fmt::Debug for InjectionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionPlanner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn cap(max_injection_tokens: usize, share: f64) -> usize {
    ((max_injection_tokens as f64) * share) as usize
}

fn clamp_tokens(text: &str, budget_tokens: usize) -> String {
    if estimate_tokens(text) <= budget_tokens {
        return text.to_owned();
    }
    let chars: Vec<char> = text.chars().collect();
    chars[..budget_tokens.saturating_mul(4).min(chars.len())]
        .iter()
        .collect()
}

fn sanitize(prompt: &str) -> String {
    let cleaned: String = prompt
        .chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                c
            }
        })
        .collect();
    cleaned.trim().to_owned()
}

fn render_truth(truth: &spindle_replay::TruthState, budget_tokens: usize) -> String {
    let mut lines = Vec::new();
    let mut tokens = 0usize;
    for fact in truth.active_facts() {
        let line = format!("[{:?}] {}: {}", fact.severity, fact.id, fact.summary);
        let cost = estimate_tokens(&line);
        if tokens + cost > budget_tokens {
            break;
        }
        tokens += cost;
        lines.push(line);
    }
    lines.join("\n")
}

fn render_task(task: &TaskState, budget_tokens: usize) -> String {
    let mut out = String::new();
    if let Some(spec) = &task.spec {
        out.push_str(&format!("goal: {}\n", spec.goal));
    }
    out.push_str(&format!(
        "phase: {} health: {:?}\n",
        task.status.phase.as_str(),
        task.status.health
    ));
    for item in &task.items {
        out.push_str(&format!("- [{:?}] {}\n", item.state, item.title));
    }
    for blocker in &task.blockers {
        out.push_str(&format!("! {} ({})\n", blocker.message, blocker.source));
    }
    clamp_tokens(out.trim_end(), budget_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_skills::{SkillContract, SkillTier};

    struct Fixture {
        _dir: tempfile::TempDir,
        events: Arc<EventStore>,
        budget: Arc<ContextBudget>,
        planner: InjectionPlanner,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventStore::new(dir.path(), true));
        let replay = Arc::new(ReplayEngine::new(Arc::clone(&events)));
        let ledger = Arc::new(LedgerStore::open(dir.path()));
        let skills = Arc::new(SkillRegistry::new());
        skills.register(SkillContract::new(
            "refactor",
            SkillTier::Base,
            &["refactor"],
        ));
        let budget = Arc::new(ContextBudget::new(crate::ContextBudgetConfig::default()));
        let planner = InjectionPlanner::new(
            PlannerConfig::default(),
            Arc::clone(&events),
            replay,
            ledger,
            skills,
            Arc::clone(&budget),
        );
        Fixture {
            _dir: dir,
            events,
            budget,
            planner,
        }
    }

    fn plan_input(prompt: &str) -> PlanInput {
        PlanInput {
            session_id: "s1".into(),
            prompt: prompt.to_owned(),
            usage: None,
            scope: None,
            verification_failed: false,
            memory_handoff: None,
        }
    }

    #[test]
    fn test_block_carries_sections() {
        let f = fixture();
        f.events
            .append(
                AppendEvent::new("s1", "task_ledger:spec_set")
                    .with_payload(json!({"goal": "refactor the parser", "targetFiles": ["src/parser.rs"]})),
            )
            .unwrap();
        f.events
            .append(
                AppendEvent::new("s1", "truth_ledger:fact_upserted").with_payload(
                    json!({"id": "f1", "kind": "note", "severity": "error", "summary": "flaky test"}),
                ),
            )
            .unwrap();

        f.budget.begin_turn(&"s1".into(), 1);
        let outcome = f.planner.plan(&plan_input("please refactor this"));
        assert!(outcome.accepted);
        assert!(outcome.text.contains("[Truth]"));
        assert!(outcome.text.contains("[Task]"));
        assert!(outcome.text.contains("[Viewport]"));
        assert!(outcome.text.contains("[Skills]"));
    }

    #[test]
    fn test_duplicate_scope_injection_dropped() {
        let f = fixture();
        f.events
            .append(
                AppendEvent::new("s1", "task_ledger:spec_set")
                    .with_payload(json!({"goal": "stable goal"})),
            )
            .unwrap();

        f.budget.begin_turn(&"s1".into(), 1);
        let first = f.planner.plan(&plan_input("same prompt"));
        assert!(first.accepted);
        let second = f.planner.plan(&plan_input("same prompt"));
        assert!(!second.accepted);
        assert_eq!(second.dropped_reason.as_deref(), Some("duplicate"));

        // A sibling branch with its own scope still gets the block.
        let mut branch = plan_input("same prompt");
        branch.scope = Some("branch-b".to_owned());
        assert!(f.planner.plan(&branch).accepted);
    }

    #[test]
    fn test_status_alignment_emits_once() {
        let f = fixture();
        f.budget.begin_turn(&"s1".into(), 1);
        // No spec: align/needs_spec differs from the default unknown health.
        let first = f.planner.plan(&plan_input("hello"));
        assert!(first.status_changed);

        let second = f.planner.plan(&plan_input("hello again"));
        assert!(!second.status_changed);

        let status_events = f.events.list(
            &"s1".into(),
            &EventFilter {
                event_type: Some("task_ledger:status_set".to_owned()),
                last: None,
            },
        );
        assert_eq!(status_events.len(), 1);
    }

    #[test]
    fn test_critical_pressure_injects_gate_block_and_event() {
        let f = fixture();
        f.budget.begin_turn(&"s1".into(), 1);
        let mut input = plan_input("anything");
        input.usage = Some(ContextUsage::new(86, 100));

        let outcome = f.planner.plan(&input);
        // The combined block itself is refused at the hard limit, but the
        // gate event must have been recorded.
        let armed = f.events.list(
            &"s1".into(),
            &EventFilter {
                event_type: Some("context_compaction_gate_armed".to_owned()),
                last: None,
            },
        );
        assert_eq!(armed.len(), 1);
        assert!(!outcome.accepted);
        assert_eq!(outcome.dropped_reason.as_deref(), Some("hard_limit"));
    }

    #[test]
    fn test_degraded_output_health_slims_block() {
        let f = fixture();
        f.events
            .append(
                AppendEvent::new("s1", "task_ledger:spec_set")
                    .with_payload(json!({"goal": "goal", "targetFiles": ["a.rs"]})),
            )
            .unwrap();
        f.events
            .append(
                AppendEvent::new("s1", "message_update")
                    .with_payload(json!({"health": {"score": 0.2, "drunk": true}})),
            )
            .unwrap();

        f.budget.begin_turn(&"s1".into(), 1);
        let outcome = f.planner.plan(&plan_input("prompt"));
        assert!(outcome.accepted);
        assert!(outcome.text.contains("[Task]"));
        // Medium/low priority sections are dropped for a degraded agent.
        assert!(!outcome.text.contains("[Viewport]"));
        assert!(!outcome.text.contains("[Skills]"));
    }
}
