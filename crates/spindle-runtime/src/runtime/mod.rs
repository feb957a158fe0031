//! The runtime orchestrator.

mod tool_calls;
mod truth_sync;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use serde_json::json;
use tracing::{debug, info, warn};

use spindle_budget::{CostOutcome, CostTracker, ParallelBudget};
use spindle_config::{Config, load_config, state_dir};
use spindle_context::{ContextBudget, InjectionOutcome, InjectionPlanner, PlanInput};
use spindle_core::{SessionId, ToolCallId, now_ms};
use spindle_events::{
    AppendEvent, EventCategory, EventError, EventRecord, EventStore, EventSubscriber,
};
use spindle_ledger::LedgerStore;
use spindle_patch::{FileChangeTracker, RollbackResult};
use spindle_replay::ReplayEngine;
use spindle_schedule::{IntentExecutor, Scheduler};
use spindle_skills::{SkillRegistry, ToolAccessGate};
use spindle_verify::VerificationGate;
use spindle_wal::TurnWal;

use crate::config_bridge;
use crate::error::{RuntimeError, RuntimeResult};
use crate::lock::WorkspaceLock;

pub use tool_calls::{FinishToolCall, StartOutcome, StartToolCall, ToolCallPhase};

pub(crate) struct ToolCallEntry {
    pub(crate) phase: ToolCallPhase,
    pub(crate) tool_name: String,
}

#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) turn: u64,
    pub(crate) active_skill: Option<String>,
    pub(crate) tool_calls: HashMap<ToolCallId, ToolCallEntry>,
    pub(crate) last_ledger_compaction_turn: Option<u64>,
}

/// Tears down transient session state when a shutdown event is observed,
/// regardless of who appended it.
struct ShutdownSubscriber {
    runtime: Weak<Runtime>,
}

impl EventSubscriber for ShutdownSubscriber {
    fn on_event(&self, record: &EventRecord) {
        if record.category() == EventCategory::Session
            && record.event_type == "session_shutdown"
            && let Some(runtime) = self.runtime.upgrade()
        {
            runtime.clear_session_state(&record.session_id);
        }
    }

    fn name(&self) -> &str {
        "runtime-shutdown"
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    workspace_root: PathBuf,
    executor: Option<Arc<dyn IntentExecutor>>,
    config: Option<Config>,
    hold_lock: bool,
}

impl RuntimeBuilder {
    /// Start building a runtime for a workspace.
    #[must_use]
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            executor: None,
            config: None,
            hold_lock: false,
        }
    }

    /// Provide the intent executor (required for scheduled fires to do
    /// anything).
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn IntentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use this configuration instead of loading the overlay file.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Acquire the workspace PID lock at build time (daemon mode).
    #[must_use]
    pub fn with_workspace_lock(mut self) -> Self {
        self.hold_lock = true;
        self
    }

    /// Build the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when configuration cannot be loaded or another
    /// process holds the workspace lock.
    pub fn build(self) -> RuntimeResult<Arc<Runtime>> {
        let config = match self.config {
            Some(config) => config,
            None => load_config(&self.workspace_root)?,
        };
        let state = state_dir(&self.workspace_root);

        let lock = if self.hold_lock {
            Some(
                WorkspaceLock::acquire(&state, None)
                    .map_err(|err| RuntimeError::WorkspaceLocked(err.to_string()))?,
            )
        } else {
            None
        };

        let events = Arc::new(EventStore::new(&state, config.events.enabled));
        let ledger = Arc::new(LedgerStore::open(&state));
        let replay = Arc::new(ReplayEngine::new(Arc::clone(&events)));
        let patches = Arc::new(FileChangeTracker::new(
            &self.workspace_root,
            &config.patch.mutation_tools,
            config.patch.record_diff_text,
            config.patch.max_history_per_session,
        ));
        let context = Arc::new(ContextBudget::new(config_bridge::context_config(&config)));
        let skills = Arc::new(SkillRegistry::new());
        let access = Arc::new(ToolAccessGate::new(config_bridge::access_config(&config)));
        let cost = Arc::new(CostTracker::new(config_bridge::cost_config(&config)));
        let parallel = Arc::new(ParallelBudget::new(config_bridge::parallel_config(&config)));
        let verify = Arc::new(VerificationGate::new(
            &self.workspace_root,
            config_bridge::verify_config(&config),
        ));
        let wal = Arc::new(TurnWal::open(&state, config_bridge::wal_config(&config)));
        let planner = Arc::new(InjectionPlanner::new(
            config_bridge::planner_config(&config),
            Arc::clone(&events),
            Arc::clone(&replay),
            Arc::clone(&ledger),
            Arc::clone(&skills),
            Arc::clone(&context),
        ));

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(NullExecutor) as Arc<dyn IntentExecutor>);
        let scheduler = Scheduler::new(
            config_bridge::schedule_config(&config),
            &state,
            Arc::clone(&events),
            Arc::clone(&replay),
            Some(Arc::clone(&wal)),
            executor,
        );

        let runtime = Arc::new(Runtime {
            workspace_root: self.workspace_root,
            config,
            events,
            ledger,
            replay,
            patches,
            context,
            planner,
            skills,
            access,
            cost,
            parallel,
            verify,
            wal,
            scheduler,
            sessions: Mutex::new(HashMap::new()),
            lock: Mutex::new(lock),
        });

        runtime.events.subscribe(Arc::new(ShutdownSubscriber {
            runtime: Arc::downgrade(&runtime),
        }));

        info!(workspace = %runtime.workspace_root.display(), "runtime built");
        Ok(runtime)
    }
}

struct NullExecutor;

#[async_trait::async_trait]
impl IntentExecutor for NullExecutor {
    async fn execute(
        &self,
        _intent: &spindle_schedule::ScheduleIntent,
        _run_index: u32,
        _wakeup_message: &str,
    ) -> Result<spindle_schedule::ExecutionOutcome, spindle_schedule::ExecutorError> {
        Err(spindle_schedule::ExecutorError(
            "no intent executor configured".to_owned(),
        ))
    }
}

/// The per-workspace runtime.
pub struct Runtime {
    pub(crate) workspace_root: PathBuf,
    pub(crate) config: Config,
    pub(crate) events: Arc<EventStore>,
    pub(crate) ledger: Arc<LedgerStore>,
    pub(crate) replay: Arc<ReplayEngine>,
    pub(crate) patches: Arc<FileChangeTracker>,
    pub(crate) context: Arc<ContextBudget>,
    pub(crate) planner: Arc<InjectionPlanner>,
    pub(crate) skills: Arc<SkillRegistry>,
    pub(crate) access: Arc<ToolAccessGate>,
    pub(crate) cost: Arc<CostTracker>,
    pub(crate) parallel: Arc<ParallelBudget>,
    pub(crate) verify: Arc<VerificationGate>,
    pub(crate) wal: Arc<TurnWal>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) sessions: Mutex<HashMap<SessionId, SessionState>>,
    lock: Mutex<Option<WorkspaceLock>>,
}

impl Runtime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder(workspace_root: impl Into<PathBuf>) -> RuntimeBuilder {
        RuntimeBuilder::new(workspace_root)
    }

    /// The workspace this runtime owns.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// The configuration in force.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The event store.
    #[must_use]
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// The evidence ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// The replay engine.
    #[must_use]
    pub fn replay(&self) -> &Arc<ReplayEngine> {
        &self.replay
    }

    /// The skill registry (contracts are registered by collaborators).
    #[must_use]
    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    /// The scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The turn WAL.
    #[must_use]
    pub fn wal(&self) -> &Arc<TurnWal> {
        &self.wal
    }

    /// The parallel slot budget.
    #[must_use]
    pub fn parallel(&self) -> &Arc<ParallelBudget> {
        &self.parallel
    }

    /// Mark a session as started, recording `session_started`.
    pub fn begin_session(&self, session_id: &SessionId) -> RuntimeResult<()> {
        self.lock_sessions().entry(session_id.clone()).or_default();
        self.emit(
            AppendEvent::new(session_id.clone(), "session_started")
                .with_payload(json!({"schema": "spindle.event.v1", "startedAt": now_ms()})),
        );
        Ok(())
    }

    /// Start a new agent turn; returns the turn index.
    pub fn begin_turn(&self, session_id: &SessionId) -> u64 {
        let turn = {
            let mut sessions = self.lock_sessions();
            let session = sessions.entry(session_id.clone()).or_default();
            session.turn += 1;
            session.turn
        };
        self.context.begin_turn(session_id, turn);
        turn
    }

    /// The current turn index for a session.
    #[must_use]
    pub fn current_turn(&self, session_id: &SessionId) -> u64 {
        self.lock_sessions()
            .get(session_id)
            .map_or(0, |s| s.turn)
    }

    /// Activate a skill for a session.
    pub fn activate_skill(&self, session_id: &SessionId, skill: &str) {
        let mut sessions = self.lock_sessions();
        let session = sessions.entry(session_id.clone()).or_default();
        session.active_skill = Some(skill.to_owned());
        debug!(session = %session_id, skill, "skill activated");
    }

    /// Deactivate the session's active skill.
    pub fn complete_skill(&self, session_id: &SessionId) {
        if let Some(session) = self.lock_sessions().get_mut(session_id) {
            session.active_skill = None;
        }
    }

    /// Plan the hidden context block for the next agent turn.
    #[must_use]
    pub fn plan_context(&self, input: &PlanInput) -> InjectionOutcome {
        self.planner.plan(input)
    }

    /// Set the session's task spec (`task_ledger:spec_set`).
    ///
    /// # Errors
    ///
    /// Returns an error when the event cannot be recorded.
    pub fn set_task_spec(
        &self,
        session_id: &SessionId,
        spec: &spindle_replay::TaskSpec,
    ) -> RuntimeResult<()> {
        let payload = serde_json::to_value(spec).unwrap_or_else(|_| json!({}));
        self.events.append(
            AppendEvent::new(session_id.clone(), "task_ledger:spec_set").with_payload(payload),
        )?;
        Ok(())
    }

    /// Acquire a parallel worker slot for a run, honoring the active
    /// skill's `maxParallel` cap when enforcement is on. Idempotent per
    /// `run_id`.
    ///
    /// # Errors
    ///
    /// Returns a limit error when the session or skill cap is exhausted.
    pub fn acquire_parallel_slot(
        &self,
        session_id: &SessionId,
        run_id: &str,
    ) -> spindle_budget::ParallelResult<()> {
        let skill_cap = if self.config.security.skill_max_parallel_mode
            == spindle_config::EnforcementMode::Enforce
        {
            self.active_skill_name(session_id)
                .and_then(|name| self.skills.get(&name))
                .and_then(|contract| contract.max_parallel.map(|cap| (contract.name, cap)))
        } else {
            None
        };
        self.parallel.acquire_slot(
            session_id,
            run_id,
            skill_cap.as_ref().map(|(name, cap)| (name.as_str(), *cap)),
        )
    }

    /// Release a parallel worker slot. Idempotent.
    pub fn release_parallel_slot(&self, session_id: &SessionId, run_id: &str) {
        self.parallel.release_slot(session_id, run_id);
    }

    /// Record a turn's token usage and cost; emits `cost_recorded` and,
    /// on first threshold crossing, `cost_alert`.
    pub fn record_turn_cost(
        &self,
        session_id: &SessionId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostOutcome {
        let outcome = self.cost.record_turn(session_id, input_tokens, output_tokens);
        if let Some(skill) = self.active_skill_name(session_id) {
            self.access
                .record_tokens(session_id, &skill, input_tokens + output_tokens);
        }
        self.emit(
            AppendEvent::new(session_id.clone(), "cost_recorded").with_payload(json!({
                "inputTokens": input_tokens,
                "outputTokens": output_tokens,
                "turnUsd": outcome.turn_usd,
                "totalUsd": outcome.total_usd,
            })),
        );
        if let Some(alert) = &outcome.alert {
            self.emit(
                AppendEvent::new(session_id.clone(), "cost_alert").with_payload(
                    serde_json::to_value(alert).unwrap_or_else(|_| json!({})),
                ),
            );
        }
        outcome
    }

    /// Record an explicit tape anchor (handoff point).
    pub fn record_anchor(
        &self,
        session_id: &SessionId,
        name: &str,
        summary: &str,
        next_steps: &str,
    ) -> RuntimeResult<()> {
        let turn = self.current_turn(session_id);
        self.events.append(
            AppendEvent::new(session_id.clone(), "tape_anchor")
                .with_turn(turn)
                .with_payload(json!({
                    "name": name,
                    "summary": summary,
                    "nextSteps": next_steps,
                })),
        )?;
        Ok(())
    }

    /// Record a tape checkpoint carrying the full task+truth snapshot.
    pub fn record_checkpoint(&self, session_id: &SessionId) -> RuntimeResult<()> {
        let projection = self.replay.projection(session_id);
        let turn = self.current_turn(session_id);
        self.events.append(
            AppendEvent::new(session_id.clone(), "tape_checkpoint")
                .with_turn(turn)
                .with_payload(json!({
                    "task": projection.task,
                    "truth": projection.truth,
                })),
        )?;
        Ok(())
    }

    /// Roll back the newest patch set; records `patch_rolled_back`.
    pub fn rollback_last_patch(&self, session_id: &SessionId) -> RuntimeResult<RollbackResult> {
        let result = self.patches.rollback_last(session_id)?;
        self.emit(
            AppendEvent::new(session_id.clone(), "patch_rolled_back").with_payload(json!({
                "patchSetId": result.patch_set_id,
                "restoredPaths": result.restored_paths,
                "failedPaths": result.failed_paths,
            })),
        );
        Ok(result)
    }

    /// Recover persisted state after a restart: WAL first, then the
    /// scheduler (which may immediately fire catch-ups).
    pub fn recover(self: &Arc<Self>) -> RuntimeResult<RecoverySummary> {
        let wal_report = self.wal.recover()?;
        let schedule = self.scheduler.recover()?;
        Ok(RecoverySummary {
            wal_retryable: wal_report.retryable.len(),
            wal_expired: wal_report.expired.len(),
            schedule_due_fires: schedule.due_fires,
            schedule_fired: schedule.fired.len(),
            schedule_deferred: schedule.deferred.len(),
        })
    }

    /// Record `session_shutdown`; transient state is torn down by the
    /// shutdown subscriber observing the event.
    pub fn shutdown_session(&self, session_id: &SessionId) {
        self.emit(
            AppendEvent::new(session_id.clone(), "session_shutdown")
                .with_payload(json!({"at": now_ms()})),
        );
    }

    /// Drop every piece of transient state for a session.
    pub fn clear_session_state(&self, session_id: &SessionId) {
        self.lock_sessions().remove(session_id);
        self.context.clear_session(session_id);
        self.access.clear_session(session_id);
        self.cost.clear_session(session_id);
        self.parallel.clear_session(session_id);
        self.verify.clear_session(session_id);
        self.patches.clear_session(session_id);
        self.replay.invalidate(session_id);
        self.events.clear_session_cache(session_id);
        debug!(session = %session_id, "session state cleared");
    }

    /// Graceful shutdown: stop scheduler timers, release the workspace
    /// lock. The event log and ledger persist.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(lock) = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            lock.release();
        }
        info!("runtime shut down");
    }

    /// Run until SIGINT/SIGTERM, then shut down.
    ///
    /// Returns the conventional exit code (130 for SIGINT).
    pub async fn run_until_shutdown(self: &Arc<Self>) -> i32 {
        let code = wait_for_signal().await;
        self.shutdown();
        code
    }

    pub(crate) fn active_skill_name(&self, session_id: &SessionId) -> Option<String> {
        self.lock_sessions()
            .get(session_id)
            .and_then(|s| s.active_skill.clone())
    }

    /// Best-effort event append: a disabled store is fine, anything else
    /// is logged.
    pub(crate) fn emit(&self, event: AppendEvent) {
        match self.events.append(event) {
            Ok(_) | Err(EventError::StoreDisabled) => {},
            Err(err) => warn!(error = %err, "runtime event append failed"),
        }
    }

    pub(crate) fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionState>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workspace_root", &self.workspace_root)
            .field("sessions", &self.lock_sessions().len())
            .finish_non_exhaustive()
    }
}

/// What `recover()` did, summarized for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    /// WAL records eligible for retry.
    pub wal_retryable: usize,
    /// WAL records expired by the scan.
    pub wal_expired: usize,
    /// Missed schedule fires found.
    pub schedule_due_fires: usize,
    /// Intents fired immediately.
    pub schedule_fired: usize,
    /// Intents deferred.
    pub schedule_deferred: usize,
}

#[cfg(unix)]
async fn wait_for_signal() -> i32 {
    use tokio::signal::unix::{SignalKind, signal};
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("signal handler registration failed");
    let mut terminate =
        signal(SignalKind::terminate()).expect("signal handler registration failed");
    tokio::select! {
        _ = interrupt.recv() => 130,
        _ = terminate.recv() => 143,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> i32 {
    let _ = tokio::signal::ctrl_c().await;
    130
}
