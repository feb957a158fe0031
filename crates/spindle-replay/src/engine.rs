//! The memoized replay engine.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spindle_core::{EventId, SessionId};
use spindle_events::{EventCategory, EventFilter, EventRecord, EventStore};
use tracing::{debug, warn};

use crate::tape::{TapeStatus, TapeThresholds, compute_tape_status};
use crate::task::{TaskState, fold_task_event};
use crate::truth::{TruthState, fold_truth_event};

/// The combined projection of a session's ledger events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionProjection {
    /// Folded task state.
    pub task: TaskState,
    /// Folded truth state.
    pub truth: TruthState,
}

#[derive(Debug, Deserialize)]
struct CheckpointPayload {
    task: TaskState,
    truth: TruthState,
}

/// Fold a full event stream into a projection.
///
/// A `tape_checkpoint` event replaces the working state; subsequent
/// events continue to apply on top. Replaying any prefix is deterministic.
#[must_use]
pub fn fold_session(records: &[EventRecord]) -> SessionProjection {
    let mut projection = SessionProjection::default();

    for record in records {
        match record.category() {
            EventCategory::TaskLedger => fold_task_event(&mut projection.task, record),
            EventCategory::TruthLedger => fold_truth_event(&mut projection.truth, record),
            EventCategory::TapeCheckpoint => {
                let Some(payload) = record.payload.as_ref() else {
                    continue;
                };
                match serde_json::from_value::<CheckpointPayload>(payload.clone()) {
                    Ok(snapshot) => {
                        projection.task = snapshot.task;
                        projection.truth = snapshot.truth;
                    },
                    Err(err) => {
                        warn!(event = %record.id, error = %err, "bad checkpoint payload ignored");
                    },
                }
            },
            _ => {},
        }
    }

    projection
}

struct CacheEntry {
    head: Option<EventId>,
    projection: Arc<SessionProjection>,
}

/// Memoized projections over the event store.
///
/// The memo key is (session, head event id): a cached projection is reused
/// until a new record lands, and dropped on `invalidate`.
pub struct ReplayEngine {
    store: Arc<EventStore>,
    cache: DashMap<SessionId, CacheEntry>,
}

impl ReplayEngine {
    /// Create an engine over a store.
    #[must_use]
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// The current projection for a session, folding lazily.
    #[must_use]
    pub fn projection(&self, session_id: &SessionId) -> Arc<SessionProjection> {
        let head = self.store.head_event_id(session_id);

        if let Some(entry) = self.cache.get(session_id)
            && entry.head == head
        {
            return Arc::clone(&entry.projection);
        }

        let records = self.store.list(session_id, &EventFilter::default());
        let projection = Arc::new(fold_session(&records));
        debug!(session = %session_id, records = records.len(), "projection rebuilt");
        self.cache.insert(
            session_id.clone(),
            CacheEntry {
                head,
                projection: Arc::clone(&projection),
            },
        );
        projection
    }

    /// The folded task state.
    #[must_use]
    pub fn task_state(&self, session_id: &SessionId) -> TaskState {
        self.projection(session_id).task.clone()
    }

    /// The folded truth state.
    #[must_use]
    pub fn truth_state(&self, session_id: &SessionId) -> TruthState {
        self.projection(session_id).truth.clone()
    }

    /// Tape status over the session's full stream.
    #[must_use]
    pub fn tape_status(&self, session_id: &SessionId, thresholds: &TapeThresholds) -> TapeStatus {
        let records = self.store.list(session_id, &EventFilter::default());
        compute_tape_status(&records, thresholds)
    }

    /// Drop the cached projection for a session.
    pub fn invalidate(&self, session_id: &SessionId) {
        self.cache.remove(session_id);
    }
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("cached_sessions", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPhase;
    use serde_json::json;
    use spindle_events::AppendEvent;

    fn setup() -> (tempfile::TempDir, Arc<EventStore>, ReplayEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::new(dir.path(), true));
        let engine = ReplayEngine::new(Arc::clone(&store));
        (dir, store, engine)
    }

    #[test]
    fn test_fold_is_prefix_deterministic() {
        let (_dir, store, engine) = setup();
        store
            .append(
                AppendEvent::new("s1", "task_ledger:spec_set")
                    .with_payload(json!({"goal": "build"})),
            )
            .unwrap();
        store
            .append(
                AppendEvent::new("s1", "truth_ledger:fact_upserted").with_payload(
                    json!({"id": "f1", "kind": "note", "summary": "a fact"}),
                ),
            )
            .unwrap();

        let first = engine.projection(&"s1".into());
        let records = store.list(&"s1".into(), &EventFilter::default());
        let refolded = fold_session(&records);
        assert_eq!(*first, refolded);
    }

    #[test]
    fn test_memoization_until_new_event() {
        let (_dir, store, engine) = setup();
        store
            .append(
                AppendEvent::new("s1", "task_ledger:status_set")
                    .with_payload(json!({"phase": "execute", "health": "ok"})),
            )
            .unwrap();

        let a = engine.projection(&"s1".into());
        let b = engine.projection(&"s1".into());
        assert!(Arc::ptr_eq(&a, &b));

        store
            .append(
                AppendEvent::new("s1", "task_ledger:status_set")
                    .with_payload(json!({"phase": "verify", "health": "ok"})),
            )
            .unwrap();
        let c = engine.projection(&"s1".into());
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.task.status.phase, TaskPhase::Verify);
    }

    #[test]
    fn test_checkpoint_replaces_state() {
        let (_dir, store, engine) = setup();
        store
            .append(
                AppendEvent::new("s1", "task_ledger:spec_set")
                    .with_payload(json!({"goal": "before checkpoint"})),
            )
            .unwrap();

        // A checkpoint carrying a different state replaces the fold.
        let snapshot = json!({
            "task": {"spec": {"goal": "from checkpoint"}, "status": {"phase": "verify", "health": "ok"}},
            "truth": {"facts": {}},
        });
        store
            .append(AppendEvent::new("s1", "tape_checkpoint").with_payload(snapshot))
            .unwrap();
        store
            .append(
                AppendEvent::new("s1", "task_ledger:item_upserted")
                    .with_payload(json!({"id": "i1", "title": "next", "state": "todo"})),
            )
            .unwrap();

        let projection = engine.projection(&"s1".into());
        assert_eq!(
            projection.task.spec.as_ref().unwrap().goal,
            "from checkpoint"
        );
        assert_eq!(projection.task.status.phase, TaskPhase::Verify);
        // Events after the checkpoint continue to apply.
        assert_eq!(projection.task.items.len(), 1);
    }

    #[test]
    fn test_invalidate_drops_cache() {
        let (_dir, store, engine) = setup();
        store
            .append(AppendEvent::new("s1", "session_started"))
            .unwrap();
        let a = engine.projection(&"s1".into());
        engine.invalidate(&"s1".into());
        let b = engine.projection(&"s1".into());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(*a, *b);
    }
}
