//! The scheduler: intent lifecycle, leases, firing, recovery.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use spindle_core::{EventId, IntentId, SessionId, TimestampMs, now_ms};
use spindle_events::{AppendEvent, EventCategory, EventRecord, EventStore, EventSubscriber, SubscriberId};
use spindle_replay::ReplayEngine;
use spindle_wal::{AppendOptions, TurnEnvelope, TurnSource, TurnWal, WalStatus};

use crate::cron_match::{next_cron_match, parse_cron, parse_time_zone};
use crate::error::{ScheduleError, ScheduleResult};
use crate::intent::{
    ContinuityMode, CreateIntentInput, IntentStatus, SCHEDULE_PROJECTION_SCHEMA, SCHEDULE_SCHEMA,
    ScheduleIntent, UpdateIntentInput,
};
use crate::wakeup::build_wakeup_message;

/// Scheduler configuration (mirrors the `schedule` config section).
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Master switch.
    pub enabled: bool,
    /// Minimum spacing between two fires of one intent.
    pub min_interval_ms: i64,
    /// Lease taken around a fire.
    pub lease_duration_ms: i64,
    /// Cap on active intents per parent session.
    pub max_active_intents_per_session: usize,
    /// Cap on active intents across the workspace.
    pub max_active_intents_global: usize,
    /// Error streak that opens the circuit.
    pub max_consecutive_errors: u32,
    /// Missed fires executed immediately during recovery.
    pub max_recovery_catch_ups: usize,
    /// Base for the exponential error backoff.
    pub error_backoff_base_ms: i64,
    /// Ceiling for the exponential error backoff.
    pub error_backoff_cap_ms: i64,
}

impl Default for ScheduleConfig {
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

/// What an executed intent run produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// The child session the run evaluated in, if one was created.
    pub evaluation_session_id: Option<SessionId>,
    /// Executor-suggested next fire time (clamped to the min interval).
    pub next_run_at: Option<TimestampMs>,
}

/// An executor failure.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

/// The collaborator that actually runs an intent: creates the child
/// session, delivers the wakeup message, waits for idle.
#[async_trait]
pub trait IntentExecutor: Send + Sync {
    /// Execute one run of an intent.
    async fn execute(
        &self,
        intent: &ScheduleIntent,
        run_index: u32,
        wakeup_message: &str,
    ) -> Result<ExecutionOutcome, ExecutorError>;
}

/// What `recover()` found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    /// Total missed fire occurrences across all intents.
    pub due_fires: usize,
    /// Intents fired immediately by catch-up.
    pub fired: Vec<IntentId>,
    /// Intents deferred with a spaced `nextRunAt`.
    pub deferred: Vec<IntentId>,
    /// Whether the rebuilt projection matched the on-disk snapshot.
    pub snapshot_matched: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectionSnapshot {
    schema: String,
    generated_at: TimestampMs,
    watermark_offset: u64,
    intents: Vec<ScheduleIntent>,
}

struct SchedulerSubscriber {
    scheduler: Weak<Scheduler>,
}

impl EventSubscriber for SchedulerSubscriber {
    fn on_event(&self, record: &EventRecord) {
        if record.category() != EventCategory::ScheduleIntent {
            return;
        }
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.observe_event(record);
        }
    }

    fn name(&self) -> &str {
        "scheduler"
    }
}

/// The persistent intent scheduler.
pub struct Scheduler {
    config: ScheduleConfig,
    events: Arc<EventStore>,
    replay: Arc<ReplayEngine>,
    wal: Option<Arc<TurnWal>>,
    executor: Arc<dyn IntentExecutor>,
    projection_path: PathBuf,
    intents: Mutex<HashMap<IntentId, ScheduleIntent>>,
    fire_in_progress: Mutex<HashSet<IntentId>>,
    timers: Mutex<HashMap<IntentId, JoinHandle<()>>>,
    /// Last event id folded per session; self-emitted events dedupe here.
    watermarks: Mutex<HashMap<SessionId, EventId>>,
    applied_events: Mutex<u64>,
    subscription: Mutex<Option<SubscriberId>>,
}

impl Scheduler {
    /// Wire a scheduler over the shared subsystems.
    #[must_use]
    pub fn new(
        config: ScheduleConfig,
        state_dir: &std::path::Path,
        events: Arc<EventStore>,
        replay: Arc<ReplayEngine>,
        wal: Option<Arc<TurnWal>>,
        executor: Arc<dyn IntentExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            replay,
            wal,
            executor,
            projection_path: state_dir.join("schedule").join("projection.json"),
            intents: Mutex::new(HashMap::new()),
            fire_in_progress: Mutex::new(HashSet::new()),
            timers: Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
            applied_events: Mutex::new(0),
            subscription: Mutex::new(None),
        })
    }

    /// Look up one intent's projection.
    #[must_use]
    pub fn get(&self, intent_id: &IntentId) -> Option<ScheduleIntent> {
        self.lock_intents().get(intent_id).cloned()
    }

    /// All intents, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<ScheduleIntent> {
        let mut intents: Vec<ScheduleIntent> = self.lock_intents().values().cloned().collect();
        intents.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));
        intents
    }

    /// Create an intent: validate, project, log, persist, arm.
    pub fn create_intent(
        self: &Arc<Self>,
        input: CreateIntentInput,
    ) -> ScheduleResult<ScheduleIntent> {
        if !self.config.enabled {
            return Err(ScheduleError::Disabled);
        }
        validate_shape(
            input.reason.as_str(),
            input.max_runs,
            input.run_at,
            input.cron.as_deref(),
            input.time_zone.as_deref(),
        )?;

        let now = now_ms();
        let next_run_at = self.initial_next_run(input.run_at, input.cron.as_deref(), input.time_zone.as_deref(), now)?;

        let intent = {
            let intents = self.lock_intents();
            if intents.contains_key(&input.intent_id) {
                return Err(ScheduleError::IntentIdExists(input.intent_id));
            }
            let active_global = intents
                .values()
                .filter(|i| i.status == IntentStatus::Active)
                .count();
            if active_global >= self.config.max_active_intents_global {
                return Err(ScheduleError::GlobalLimit(
                    self.config.max_active_intents_global,
                ));
            }
            let active_session = intents
                .values()
                .filter(|i| {
                    i.status == IntentStatus::Active
                        && i.parent_session_id == input.parent_session_id
                })
                .count();
            if active_session >= self.config.max_active_intents_per_session {
                return Err(ScheduleError::PerSessionLimit(
                    self.config.max_active_intents_per_session,
                ));
            }
            drop(intents);

            ScheduleIntent {
                intent_id: input.intent_id,
                parent_session_id: input.parent_session_id,
                reason: input.reason,
                goal_ref: input.goal_ref,
                continuity_mode: input.continuity_mode,
                run_at: input.run_at.map(|r| r.max(now + self.config.min_interval_ms)),
                cron: input.cron,
                time_zone: input.time_zone,
                max_runs: input.max_runs,
                run_count: 0,
                next_run_at,
                status: IntentStatus::Active,
                convergence_condition: input.convergence_condition,
                consecutive_errors: 0,
                lease_until_ms: None,
                last_error: None,
                last_evaluation_session_id: None,
                updated_at: now,
                event_offset: 0,
            }
        };

        self.store_and_log(&intent, "intent_created", json!({}))?;
        self.persist_projection()?;
        self.arm_timer(&intent);
        info!(intent = %intent.intent_id, next_run_at = ?intent.next_run_at, "intent created");
        Ok(intent)
    }

    /// Update an intent. Raising `maxRuns` can reactivate a converged
    /// intent. Replaying the same update is idempotent in the projection.
    pub fn update_intent(
        self: &Arc<Self>,
        input: UpdateIntentInput,
    ) -> ScheduleResult<ScheduleIntent> {
        if !self.config.enabled {
            return Err(ScheduleError::Disabled);
        }

        let mut intent = self
            .get(&input.intent_id)
            .ok_or_else(|| ScheduleError::NotFound(input.intent_id.clone()))?;
        if intent.parent_session_id != input.parent_session_id {
            return Err(ScheduleError::OwnerMismatch(input.intent_id));
        }
        if intent.status == IntentStatus::Cancelled {
            return Err(ScheduleError::NotActive(input.intent_id));
        }

        if let Some(reason) = input.reason {
            intent.reason = reason;
        }
        if input.run_at.is_some() {
            intent.run_at = input.run_at;
            intent.cron = None;
            intent.time_zone = None;
        }
        if let Some(cron) = input.cron {
            intent.cron = Some(cron);
            intent.run_at = None;
        }
        if input.time_zone.is_some() {
            intent.time_zone = input.time_zone;
        }
        if let Some(max_runs) = input.max_runs {
            intent.max_runs = max_runs;
        }
        if input.convergence_condition.is_some() {
            intent.convergence_condition = input.convergence_condition;
        }

        validate_shape(
            intent.reason.as_str(),
            intent.max_runs,
            intent.run_at,
            intent.cron.as_deref(),
            intent.time_zone.as_deref(),
        )?;

        let now = now_ms();
        if intent.status == IntentStatus::Converged && intent.run_count < intent.max_runs {
            intent.status = IntentStatus::Active;
        }
        if intent.status == IntentStatus::Active {
            intent.run_at = intent.run_at.map(|r| r.max(now + self.config.min_interval_ms));
            intent.next_run_at =
                self.initial_next_run(intent.run_at, intent.cron.as_deref(), intent.time_zone.as_deref(), now)?;
        }
        intent.updated_at = now;

        self.store_and_log(&intent, "intent_updated", json!({}))?;
        self.persist_projection()?;
        self.arm_timer(&intent);
        Ok(intent)
    }

    /// Cancel an intent. Takes effect on the next firing decision; an
    /// in-flight fire is not interrupted.
    pub fn cancel_intent(
        self: &Arc<Self>,
        intent_id: &IntentId,
        caller_session: &SessionId,
    ) -> ScheduleResult<ScheduleIntent> {
        let mut intent = self
            .get(intent_id)
            .ok_or_else(|| ScheduleError::NotFound(intent_id.clone()))?;
        if &intent.parent_session_id != caller_session {
            return Err(ScheduleError::OwnerMismatch(intent_id.clone()));
        }

        intent.status = IntentStatus::Cancelled;
        intent.next_run_at = None;
        intent.updated_at = now_ms();

        self.disarm_timer(intent_id);
        // A user cancellation is distinguished from a circuit-open
        // cancellation by the absent `error` field.
        self.store_and_log(&intent, "intent_cancelled", json!({ "error": null }))?;
        self.persist_projection()?;
        info!(intent = %intent_id, "intent cancelled");
        Ok(intent)
    }

    /// Fire one run of an intent. Strictly serialized per intent via the
    /// in-progress set and the lease.
    pub async fn fire_intent(self: &Arc<Self>, intent_id: &IntentId) -> ScheduleResult<()> {
        let now = now_ms();

        // Admission: one fire per intent at a time.
        let intent = {
            let mut in_progress = self.lock_in_progress();
            let Some(intent) = self.lock_intents().get(intent_id).cloned() else {
                return Err(ScheduleError::NotFound(intent_id.clone()));
            };
            if intent.status != IntentStatus::Active {
                return Err(ScheduleError::NotActive(intent_id.clone()));
            }
            if in_progress.contains(intent_id) {
                debug!(intent = %intent_id, "fire already in progress, skipping");
                return Ok(());
            }
            if let Some(lease) = intent.lease_until_ms
                && lease > now
            {
                // Someone else holds the lease; check again when it lapses.
                debug!(intent = %intent_id, lease, "lease held, re-arming");
                self.arm_timer_at(intent_id, lease + 1);
                return Ok(());
            }
            in_progress.insert(intent_id.clone());
            intent
        };

        let result = self.fire_admitted(&intent, now).await;
        self.lock_in_progress().remove(intent_id);
        result
    }

    async fn fire_admitted(
        self: &Arc<Self>,
        intent: &ScheduleIntent,
        now: TimestampMs,
    ) -> ScheduleResult<()> {
        let intent_id = &intent.intent_id;
        let run_index = intent.next_run_index();

        // Take the lease and persist it before any side effect.
        {
            let mut intents = self.lock_intents();
            if let Some(entry) = intents.get_mut(intent_id) {
                entry.lease_until_ms = Some(now + self.config.lease_duration_ms);
            }
        }
        self.persist_projection()?;

        // Record the in-flight turn before executing.
        let wal_id = match &self.wal {
            Some(wal) => {
                let dedupe = format!("schedule:{intent_id}:{run_index}");
                let record = wal
                    .append_pending(
                        TurnEnvelope {
                            turn_id: format!("turn-{intent_id}-{run_index}").into(),
                            session_id: intent.parent_session_id.clone(),
                            channel: "schedule".to_owned(),
                            payload: json!({
                                "schema": "spindle.turn.v1",
                                "intentId": intent_id,
                                "runIndex": run_index,
                            }),
                        },
                        TurnSource::Schedule,
                        &AppendOptions {
                            ttl_ms: None,
                            dedupe_key: Some(dedupe),
                        },
                    )
                    .ok();
                match record {
                    Some(record) if record.status == WalStatus::Pending => {
                        let _ = wal.mark_inflight(&record.wal_id);
                        Some(record.wal_id)
                    },
                    Some(record) => {
                        // Dedupe hit: this run is already being driven.
                        debug!(intent = %intent_id, wal = %record.wal_id, "run already recorded, skipping");
                        self.release_lease(intent_id);
                        self.persist_projection()?;
                        return Ok(());
                    },
                    None => None,
                }
            },
            None => None,
        };

        // Build the wakeup context from the parent, per continuity mode.
        let (parent_projection, anchor) = if intent.continuity_mode == ContinuityMode::Inherit {
            let projection = self.replay.projection(&intent.parent_session_id);
            let tape = self.replay.tape_status(
                &intent.parent_session_id,
                &spindle_replay::TapeThresholds {
                    low: u64::MAX,
                    medium: u64::MAX,
                    high: u64::MAX,
                },
            );
            (Some(projection), tape.last_anchor)
        } else {
            (None, None)
        };
        let wakeup =
            build_wakeup_message(intent, run_index, parent_projection.as_deref(), anchor.as_ref());

        info!(intent = %intent_id, run_index, "firing intent");
        match self.executor.execute(intent, run_index, &wakeup).await {
            Ok(outcome) => {
                if let (Some(wal), Some(wal_id)) = (&self.wal, &wal_id) {
                    let _ = wal.mark_done(wal_id);
                }
                self.complete_run(intent, run_index, &outcome, &wakeup)?;
            },
            Err(err) => {
                if let (Some(wal), Some(wal_id)) = (&self.wal, &wal_id) {
                    let _ = wal.mark_failed(wal_id, Some(err.to_string()));
                }
                self.fail_run(intent, run_index, &err)?;
            },
        }
        Ok(())
    }

    fn complete_run(
        self: &Arc<Self>,
        before: &ScheduleIntent,
        run_index: u32,
        outcome: &ExecutionOutcome,
        wakeup: &str,
    ) -> ScheduleResult<()> {
        let now = now_ms();
        let intent_id = &before.intent_id;

        // Record the wakeup on the child session's log.
        if let Some(child) = &outcome.evaluation_session_id {
            self.emit_best_effort(
                AppendEvent::new(child.clone(), "schedule_wakeup").with_payload(json!({
                    "schema": "spindle.schedule-wakeup.v1",
                    "intentId": intent_id,
                    "parentSessionId": before.parent_session_id,
                    "runIndex": run_index,
                    "message": wakeup,
                })),
            );
        }

        let converged_by_predicate = match (&before.convergence_condition, &outcome.evaluation_session_id) {
            (Some(condition), Some(child)) => {
                let projection = self.replay.projection(child);
                condition.evaluate(&projection, run_index)
            },
            (Some(condition), None) => {
                condition.evaluate(&spindle_replay::SessionProjection::default(), run_index)
            },
            (None, _) => false,
        };
        let converged = converged_by_predicate || run_index >= before.max_runs;

        let next_run_at = if converged {
            None
        } else if let Some(cron) = &before.cron {
            next_cron_match(
                cron,
                before.time_zone.as_deref(),
                now + self.config.min_interval_ms - 1,
            )?
        } else {
            outcome
                .next_run_at
                .map(|next| next.max(now + self.config.min_interval_ms))
        };

        let updated = {
            let mut intents = self.lock_intents();
            let Some(entry) = intents.get_mut(intent_id) else {
                return Err(ScheduleError::NotFound(intent_id.clone()));
            };
            entry.run_count = run_index;
            entry.consecutive_errors = 0;
            entry.last_error = None;
            entry.last_evaluation_session_id = outcome.evaluation_session_id.clone();
            entry.lease_until_ms = None;
            entry.next_run_at = next_run_at;
            entry.status = if converged {
                IntentStatus::Converged
            } else {
                IntentStatus::Active
            };
            entry.updated_at = now;
            entry.clone()
        };

        self.store_and_log(
            &updated,
            "intent_fired",
            json!({
                "runIndex": run_index,
                "error": null,
                "nextRunAt": next_run_at,
                "evaluationSessionId": outcome.evaluation_session_id,
            }),
        )?;
        if converged {
            self.store_and_log(&updated, "intent_converged", json!({ "runIndex": run_index }))?;
        }
        self.persist_projection()?;
        self.arm_timer(&updated);
        Ok(())
    }

    fn fail_run(
        self: &Arc<Self>,
        before: &ScheduleIntent,
        run_index: u32,
        err: &ExecutorError,
    ) -> ScheduleResult<()> {
        let now = now_ms();
        let intent_id = &before.intent_id;
        let errors = before.consecutive_errors + 1;
        let circuit_open = errors >= self.config.max_consecutive_errors;

        let next_run_at = if circuit_open {
            None
        } else {
            let exponent = errors.saturating_sub(1).min(20);
            let backoff = self
                .config
                .error_backoff_base_ms
                .saturating_mul(1_i64 << exponent)
                .min(self.config.error_backoff_cap_ms);
            Some(now + backoff)
        };

        let updated = {
            let mut intents = self.lock_intents();
            let Some(entry) = intents.get_mut(intent_id) else {
                return Err(ScheduleError::NotFound(intent_id.clone()));
            };
            entry.consecutive_errors = errors;
            entry.last_error = Some(err.to_string());
            entry.lease_until_ms = None;
            entry.next_run_at = next_run_at;
            entry.updated_at = now;
            if circuit_open {
                entry.status = IntentStatus::Error;
            }
            entry.clone()
        };

        warn!(intent = %intent_id, errors, circuit_open, "intent run failed");
        self.store_and_log(
            &updated,
            "intent_fired",
            json!({
                "runIndex": run_index,
                "error": err.to_string(),
                "nextRunAt": next_run_at,
            }),
        )?;

        if circuit_open {
            let cancelled = {
                let mut intents = self.lock_intents();
                let Some(entry) = intents.get_mut(intent_id) else {
                    return Err(ScheduleError::NotFound(intent_id.clone()));
                };
                entry.status = IntentStatus::Cancelled;
                entry.clone()
            };
            self.store_and_log(
                &cancelled,
                "intent_cancelled",
                json!({ "error": format!("circuit_open:{err}") }),
            )?;
        }

        self.persist_projection()?;
        if let Some(updated) = self.get(intent_id)
            && updated.is_armed()
        {
            self.arm_timer(&updated);
        }
        Ok(())
    }

    /// Recover from disk: fold the log, clear stale leases, catch up
    /// missed fires, arm timers, subscribe for new events.
    pub fn recover(self: &Arc<Self>) -> ScheduleResult<RecoveryOutcome> {
        if !self.config.enabled {
            return Err(ScheduleError::Disabled);
        }
        let now = now_ms();

        // 1. The snapshot we last persisted, for the idempotence check.
        let on_disk: Option<ProjectionSnapshot> = std::fs::read_to_string(&self.projection_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok());

        // 2. Re-fold every schedule_intent event since birth.
        let mut rebuilt: HashMap<IntentId, ScheduleIntent> = HashMap::new();
        let mut folded = 0u64;
        for session_id in self.events.list_session_ids() {
            let records = self.events.list(&session_id, &spindle_events::EventFilter::default());
            let mut last_id = None;
            for record in &records {
                if record.category() == EventCategory::ScheduleIntent {
                    if let Some(intent) = intent_from_payload(record) {
                        rebuilt.insert(intent.intent_id.clone(), intent);
                        folded += 1;
                    }
                }
                last_id = Some(record.id.clone());
            }
            if let Some(last_id) = last_id {
                self.lock_watermarks().insert(session_id, last_id);
            }
        }

        // 3. Expired leases are crashes; clear them.
        for intent in rebuilt.values_mut() {
            if intent.lease_until_ms.is_some_and(|lease| lease <= now) {
                intent.lease_until_ms = None;
            }
        }

        *self.lock_intents() = rebuilt;
        *self.lock_applied() = folded;

        // 4. Persist and compare against the previous snapshot.
        self.persist_projection()?;
        let snapshot_matched = on_disk.is_some_and(|snapshot| {
            let mut previous = snapshot.intents;
            let mut current = self.list();
            previous.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));
            current.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));
            previous == current
        });

        // 5-6. Catch up missed fires.
        let outcome = self.catch_up(now, snapshot_matched)?;

        // 7. Arm timers and start observing new events.
        for intent in self.list() {
            if intent.is_armed() && !outcome.fired.contains(&intent.intent_id) {
                self.arm_timer(&intent);
            }
        }
        self.subscribe();

        info!(
            due = outcome.due_fires,
            fired = outcome.fired.len(),
            deferred = outcome.deferred.len(),
            snapshot_matched,
            "scheduler recovered"
        );
        Ok(outcome)
    }

    fn catch_up(self: &Arc<Self>, now: TimestampMs, snapshot_matched: bool) -> ScheduleResult<RecoveryOutcome> {
        // Due intents, with how many occurrences each has missed.
        let mut due: Vec<(ScheduleIntent, usize)> = Vec::new();
        for intent in self.list() {
            if !intent.is_armed() {
                continue;
            }
            let Some(next) = intent.next_run_at else {
                continue;
            };
            if next > now {
                continue;
            }

            // A fire already in flight elsewhere defers this intent.
            let inflight = self.wal.as_ref().is_some_and(|wal| {
                wal.latest_pending_with_prefix(&format!("schedule:{}:", intent.intent_id))
                    .is_some_and(|r| r.status == WalStatus::Inflight && !r.ttl_elapsed(now))
            });
            let missed = self.missed_occurrences(&intent, next, now)?;
            if inflight {
                due.push((intent, 0));
            } else {
                due.push((intent, missed));
            }
        }

        let due_fires: usize = due.iter().map(|(_, missed)| missed).sum();

        // Round-robin across parent sessions when picking who fires now.
        let mut by_session: HashMap<SessionId, Vec<ScheduleIntent>> = HashMap::new();
        for (intent, missed) in &due {
            if *missed > 0 {
                by_session
                    .entry(intent.parent_session_id.clone())
                    .or_default()
                    .push(intent.clone());
            }
        }
        let mut session_order: Vec<SessionId> = by_session.keys().cloned().collect();
        session_order.sort();

        let mut queue: Vec<ScheduleIntent> = Vec::new();
        let mut cursor = 0usize;
        while by_session.values().any(|v| !v.is_empty()) {
            let session = &session_order[cursor % session_order.len()];
            if let Some(list) = by_session.get_mut(session)
                && !list.is_empty()
            {
                queue.push(list.remove(0));
            }
            cursor += 1;
        }

        let mut fired = Vec::new();
        let mut deferred = Vec::new();
        let mut deferred_events: HashMap<SessionId, usize> = HashMap::new();

        for (position, intent) in queue.iter().enumerate() {
            if position < self.config.max_recovery_catch_ups {
                fired.push(intent.intent_id.clone());
            } else {
                // Surplus intents get a spaced nextRunAt.
                let spaced = now + self.config.min_interval_ms * (position as i64);
                {
                    let mut intents = self.lock_intents();
                    if let Some(entry) = intents.get_mut(&intent.intent_id) {
                        entry.next_run_at = Some(spaced);
                        entry.updated_at = now;
                    }
                }
                deferred.push(intent.intent_id.clone());
                self.emit_recovery_deferred(intent, spaced, &mut deferred_events);
            }
        }

        // Missed occurrences beyond the first (which either fired or got
        // the spaced deferral above) are recorded as deferrals too.
        for (intent, missed) in &due {
            for _ in 1..*missed {
                self.emit_recovery_deferred(intent, now, &mut deferred_events);
            }
        }

        // WAL-inflight intents defer quietly to their lease/TTL.
        for (intent, missed) in &due {
            if *missed == 0 {
                deferred.push(intent.intent_id.clone());
            }
        }

        // One summary per parent session that still exists on disk; a
        // parent that was never created is skipped, not synthesized.
        let mut due_per_session: HashMap<SessionId, usize> = HashMap::new();
        for (intent, missed) in &due {
            *due_per_session
                .entry(intent.parent_session_id.clone())
                .or_insert(0) += missed;
        }
        let mut summarized: HashSet<SessionId> = HashSet::new();
        for (intent, _) in &due {
            let session = &intent.parent_session_id;
            if !summarized.insert(session.clone()) {
                continue;
            }
            if !self.events.session_exists(session) {
                continue;
            }
            self.emit_best_effort(
                AppendEvent::new(session.clone(), "schedule_recovery_summary").with_payload(
                    json!({
                        "schema": "spindle.schedule-recovery.v1",
                        "dueFires": due_per_session.get(session).copied().unwrap_or(0),
                        "fired": fired,
                        "deferred": deferred_events.get(session).copied().unwrap_or(0),
                        "snapshotMatched": snapshot_matched,
                    }),
                ),
            );
        }

        self.persist_projection()?;

        // Fire the catch-ups.
        for intent_id in &fired {
            let scheduler = Arc::clone(self);
            let intent_id = intent_id.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.fire_intent(&intent_id).await {
                    warn!(intent = %intent_id, error = %err, "catch-up fire failed");
                }
            });
        }

        Ok(RecoveryOutcome {
            due_fires,
            fired,
            deferred,
            snapshot_matched,
        })
    }

    fn emit_recovery_deferred(
        &self,
        intent: &ScheduleIntent,
        next_run_at: TimestampMs,
        counts: &mut HashMap<SessionId, usize>,
    ) {
        let session = &intent.parent_session_id;
        if !self.events.session_exists(session) {
            return;
        }
        *counts.entry(session.clone()).or_insert(0) += 1;
        self.emit_best_effort(
            AppendEvent::new(session.clone(), "schedule_recovery_deferred").with_payload(json!({
                "schema": "spindle.schedule-recovery.v1",
                "intentId": intent.intent_id,
                "nextRunAt": next_run_at,
            })),
        );
    }

    fn missed_occurrences(
        &self,
        intent: &ScheduleIntent,
        next: TimestampMs,
        now: TimestampMs,
    ) -> ScheduleResult<usize> {
        let Some(cron) = &intent.cron else {
            return Ok(1);
        };
        let mut count = 0usize;
        let mut cursor = next - 1;
        // Bounded walk; an hourly cron down for a year stays sane.
        while count < 10_000 {
            match next_cron_match(cron, intent.time_zone.as_deref(), cursor)? {
                Some(at) if at <= now => {
                    count += 1;
                    cursor = at;
                },
                _ => break,
            }
        }
        Ok(count.max(1))
    }

    /// Stop timers and unsubscribe. Intents stay on disk.
    pub fn shutdown(&self) {
        for (_, handle) in self.lock_timers().drain() {
            handle.abort();
        }
        if let Some(id) = self.lock_subscription().take() {
            self.events.unsubscribe(id);
        }
        debug!("scheduler shut down");
    }

    /// Fold an observed event into the projection (subscription path).
    /// Self-emitted events are deduplicated by the session watermark.
    fn observe_event(self: &Arc<Self>, record: &EventRecord) {
        {
            let watermarks = self.lock_watermarks();
            if watermarks
                .get(&record.session_id)
                .is_some_and(|seen| *seen >= record.id)
            {
                return;
            }
        }
        if let Some(intent) = intent_from_payload(record) {
            self.lock_intents()
                .insert(intent.intent_id.clone(), intent);
            *self.lock_applied() += 1;
        }
        self.lock_watermarks()
            .insert(record.session_id.clone(), record.id.clone());
    }

    fn subscribe(self: &Arc<Self>) {
        let mut subscription = self.lock_subscription();
        if subscription.is_none() {
            let id = self.events.subscribe(Arc::new(SchedulerSubscriber {
                scheduler: Arc::downgrade(self),
            }));
            *subscription = Some(id);
        }
    }

    fn initial_next_run(
        &self,
        run_at: Option<TimestampMs>,
        cron: Option<&str>,
        time_zone: Option<&str>,
        now: TimestampMs,
    ) -> ScheduleResult<Option<TimestampMs>> {
        if let Some(run_at) = run_at {
            if run_at <= 0 {
                return Err(ScheduleError::InvalidRunAt(format!(
                    "runAt {run_at} is not a timestamp"
                )));
            }
            // Boundary rule: anything sooner than the minimum interval
            // rounds up to it.
            return Ok(Some(run_at.max(now + self.config.min_interval_ms)));
        }
        if let Some(cron) = cron {
            return next_cron_match(cron, time_zone, now);
        }
        Ok(None)
    }

    fn arm_timer(self: &Arc<Self>, intent: &ScheduleIntent) {
        if !intent.is_armed() {
            self.disarm_timer(&intent.intent_id);
            return;
        }
        if let Some(next) = intent.next_run_at {
            self.arm_timer_at(&intent.intent_id, next);
        }
    }

    fn arm_timer_at(self: &Arc<Self>, intent_id: &IntentId, at: TimestampMs) {
        let delay_ms = (at - now_ms()).max(0) as u64;
        let scheduler = Arc::clone(self);
        let id = intent_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            if let Err(err) = scheduler.fire_intent(&id).await {
                warn!(intent = %id, error = %err, "timer fire failed");
            }
        });
        if let Some(previous) = self.lock_timers().insert(intent_id.clone(), handle) {
            previous.abort();
        }
    }

    fn disarm_timer(&self, intent_id: &IntentId) {
        if let Some(handle) = self.lock_timers().remove(intent_id) {
            handle.abort();
        }
    }

    fn release_lease(&self, intent_id: &IntentId) {
        let mut intents = self.lock_intents();
        if let Some(entry) = intents.get_mut(intent_id) {
            entry.lease_until_ms = None;
        }
    }

    /// Insert the intent into the projection and log the lifecycle event
    /// on the parent session, carrying the full snapshot for idempotent
    /// replay.
    fn store_and_log(
        &self,
        intent: &ScheduleIntent,
        op: &str,
        extra: serde_json::Value,
    ) -> ScheduleResult<()> {
        self.lock_intents()
            .insert(intent.intent_id.clone(), intent.clone());

        let mut payload = json!({
            "schema": SCHEDULE_SCHEMA,
            "intent": intent,
        });
        if let (Some(object), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }

        let record = self.events.append(
            AppendEvent::new(
                intent.parent_session_id.clone(),
                format!("schedule_intent:{op}"),
            )
            .with_payload(payload),
        );
        match record {
            Ok(record) => {
                // Our own append lands in the watermark so the
                // subscription path skips it.
                self.lock_watermarks()
                    .insert(record.session_id.clone(), record.id);
                *self.lock_applied() += 1;
                Ok(())
            },
            Err(spindle_events::EventError::StoreDisabled) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn emit_best_effort(&self, event: AppendEvent) {
        match self.events.append(event) {
            Ok(record) => {
                self.lock_watermarks()
                    .insert(record.session_id.clone(), record.id);
            },
            Err(spindle_events::EventError::StoreDisabled) => {},
            Err(err) => warn!(error = %err, "scheduler event append failed"),
        }
    }

    fn persist_projection(&self) -> ScheduleResult<()> {
        let snapshot = ProjectionSnapshot {
            schema: SCHEDULE_PROJECTION_SCHEMA.to_owned(),
            generated_at: now_ms(),
            watermark_offset: *self.lock_applied(),
            intents: self.list(),
        };
        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| ScheduleError::PersistFailed(err.to_string()))?;

        if let Some(parent) = self.projection_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| ScheduleError::PersistFailed(err.to_string()))?;
        }
        let tmp = self.projection_path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .and_then(|()| std::fs::rename(&tmp, &self.projection_path))
            .map_err(|err| ScheduleError::PersistFailed(err.to_string()))
    }

    fn lock_intents(&self) -> std::sync::MutexGuard<'_, HashMap<IntentId, ScheduleIntent>> {
        self.intents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_in_progress(&self) -> std::sync::MutexGuard<'_, HashSet<IntentId>> {
        self.fire_in_progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, HashMap<IntentId, JoinHandle<()>>> {
        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_watermarks(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, EventId>> {
        self.watermarks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_applied(&self) -> std::sync::MutexGuard<'_, u64> {
        self.applied_events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<SubscriberId>> {
        self.subscription
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("intents", &self.lock_intents().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn intent_from_payload(record: &EventRecord) -> Option<ScheduleIntent> {
    let payload = record.payload.as_ref()?;
    serde_json::from_value(payload.get("intent")?.clone()).ok()
}

fn validate_shape(
    reason: &str,
    max_runs: u32,
    run_at: Option<TimestampMs>,
    cron: Option<&str>,
    time_zone: Option<&str>,
) -> ScheduleResult<()> {
    if reason.trim().is_empty() {
        return Err(ScheduleError::MissingReason);
    }
    if max_runs == 0 {
        return Err(ScheduleError::InvalidMaxRuns);
    }
    match (run_at, cron) {
        (Some(_), Some(_)) => return Err(ScheduleError::RunAtAndCron),
        (None, None) => return Err(ScheduleError::MissingSchedule),
        _ => {},
    }
    if time_zone.is_some() && cron.is_none() {
        return Err(ScheduleError::TimeZoneRequiresCron);
    }
    if let Some(cron) = cron {
        parse_cron(cron)?;
        parse_time_zone(time_zone)?;
    }
    Ok(())
}
