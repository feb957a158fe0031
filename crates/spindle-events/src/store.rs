//! The durable event store.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use spindle_core::{ErrorCode, EventId, SessionId, TimestampMs, now_ms};

use crate::record::EventRecord;
use crate::subscriber::{EventSubscriber, SubscriberId, SubscriberRegistry};
use std::sync::Arc;

/// Errors raised by the event store.
#[derive(Debug, Error)]
pub enum EventError {
    /// Events are turned off in configuration; callers treat the record as
    /// best-effort and must not depend on durability.
    #[error("event store is disabled")]
    StoreDisabled,

    /// A log file could not be read or written.
    #[error("event log I/O failed for {path}: {source}")]
    Io {
        /// Log file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("event encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for EventError {
    fn code(&self) -> &'static str {
        match self {
            Self::StoreDisabled => "infra_events_store_disabled",
            Self::Io { .. } => "infra_event_append_failed",
            Self::Encode(_) => "infra_event_encode_failed",
        }
    }
}

/// Result type for event store operations.
pub type EventResult<T> = Result<T, EventError>;

/// Input to [`EventStore::append`].
#[derive(Debug, Clone)]
pub struct AppendEvent {
    /// Owning session.
    pub session_id: SessionId,
    /// Free-form type tag with a conventional prefix.
    pub event_type: String,
    /// Turn counter, when the caller tracks one.
    pub turn: Option<u64>,
    /// Structured payload.
    pub payload: Option<Value>,
    /// Override timestamp; `None` means "now".
    pub timestamp: Option<TimestampMs>,
}

impl AppendEvent {
    /// Convenience constructor for the common case.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, event_type: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            turn: None,
            payload: None,
            timestamp: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a turn counter.
    #[must_use]
    pub fn with_turn(mut self, turn: u64) -> Self {
        self.turn = Some(turn);
        self
    }
}

/// Filter for [`EventStore::list`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact type tag to match.
    pub event_type: Option<String>,
    /// Return only the trailing N matching records.
    pub last: Option<usize>,
}

struct SessionLog {
    records: Vec<EventRecord>,
    next_seq: u64,
}

/// Append-only per-session event log with an in-memory tail cache.
///
/// One process owns a workspace; per-session ordering is total and ids are
/// monotone within a session. Subscribers are notified synchronously on the
/// append path, after durability and with no lock held.
pub struct EventStore {
    events_dir: PathBuf,
    enabled: bool,
    sessions: DashMap<SessionId, SessionLog>,
    registry: SubscriberRegistry,
}

impl EventStore {
    /// Open a store rooted at the workspace state directory.
    ///
    /// The `events/` subdirectory is created lazily on first append.
    #[must_use]
    pub fn new(state_dir: &Path, enabled: bool) -> Self {
        Self {
            events_dir: state_dir.join("events"),
            enabled,
            sessions: DashMap::new(),
            registry: SubscriberRegistry::new(),
        }
    }

    /// Whether appends are durable.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append a record: assign id and timestamp, persist, cache, publish.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::StoreDisabled`] when events are off in config,
    /// or an I/O error when the log file cannot be written.
    pub fn append(&self, input: AppendEvent) -> EventResult<EventRecord> {
        if !self.enabled {
            return Err(EventError::StoreDisabled);
        }

        std::fs::create_dir_all(&self.events_dir).map_err(|source| EventError::Io {
            path: self.events_dir.clone(),
            source,
        })?;

        let path = self.session_path(&input.session_id);
        let record = {
            let mut log = self
                .sessions
                .entry(input.session_id.clone())
                .or_insert_with(|| Self::load_session(&path));

            let seq = log.next_seq;
            log.next_seq += 1;

            let record = EventRecord {
                id: EventId(format!("evt-{seq:08}")),
                session_id: input.session_id.clone(),
                event_type: input.event_type,
                timestamp: input.timestamp.unwrap_or_else(now_ms),
                turn: input.turn,
                payload: input.payload,
            };

            let line = serde_json::to_string(&record)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| EventError::Io {
                    path: path.clone(),
                    source,
                })?;
            file.write_all(line.as_bytes())
                .and_then(|()| file.write_all(b"\n"))
                .and_then(|()| file.flush())
                .map_err(|source| EventError::Io {
                    path: path.clone(),
                    source,
                })?;

            log.records.push(record.clone());
            record
        };

        // Listener invocation holds no lock.
        self.registry.notify(&record);
        Ok(record)
    }

    /// List a session's records in insertion order.
    ///
    /// Loads the on-disk log into the tail cache on first access.
    #[must_use]
    pub fn list(&self, session_id: &SessionId, filter: &EventFilter) -> Vec<EventRecord> {
        let log = self.ensure_loaded(session_id);
        let matching: Vec<EventRecord> = log
            .records
            .iter()
            .filter(|r| {
                filter
                    .event_type
                    .as_ref()
                    .is_none_or(|t| &r.event_type == t)
            })
            .cloned()
            .collect();

        match filter.last {
            Some(n) if matching.len() > n => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    /// The id of the newest record in a session, if any.
    #[must_use]
    pub fn head_event_id(&self, session_id: &SessionId) -> Option<EventId> {
        let log = self.ensure_loaded(session_id);
        log.records.last().map(|r| r.id.clone())
    }

    /// Number of records in a session.
    #[must_use]
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.ensure_loaded(session_id).records.len()
    }

    /// Whether a session has no records.
    #[must_use]
    pub fn is_empty(&self, session_id: &SessionId) -> bool {
        self.len(session_id) == 0
    }

    /// Whether a session has a log file on disk.
    #[must_use]
    pub fn session_exists(&self, session_id: &SessionId) -> bool {
        self.session_path(session_id).exists()
    }

    /// Discover sessions via the log directory.
    #[must_use]
    pub fn list_session_ids(&self) -> Vec<SessionId> {
        let Ok(entries) = std::fs::read_dir(&self.events_dir) else {
            return Vec::new();
        };
        let mut ids: Vec<SessionId> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".ndjson")?;
                Some(SessionId::from(stem))
            })
            .collect();
        ids.sort();
        ids
    }

    /// Drop a session's tail cache (teardown). The on-disk log is kept.
    pub fn clear_session_cache(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    /// Register a subscriber for all future appends.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        self.registry.register(subscriber)
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.registry.unregister(id);
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        // Session ids are expected to be path-safe; anything else is
        // replaced so a hostile id cannot escape the events directory.
        let safe: String = session_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.events_dir.join(format!("{safe}.ndjson"))
    }

    fn ensure_loaded(
        &self,
        session_id: &SessionId,
    ) -> dashmap::mapref::one::RefMut<'_, SessionId, SessionLog> {
        let path = self.session_path(session_id);
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| Self::load_session(&path))
    }

    fn load_session(path: &Path) -> SessionLog {
        let Ok(file) = File::open(path) else {
            return SessionLog {
                records: Vec::new(),
                next_seq: 0,
            };
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else {
                warn!(path = %path.display(), line = index, "unreadable line, truncating log here");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    // A partial trailing line from a crash mid-append, or a
                    // corrupt record. Continue from the last valid one.
                    warn!(
                        path = %path.display(),
                        line = index,
                        error = %err,
                        "malformed event line discarded"
                    );
                    break;
                },
            }
        }

        debug!(path = %path.display(), records = records.len(), "loaded session log");
        let next_seq = records.len() as u64;
        SessionLog { records, next_seq }
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("events_dir", &self.events_dir)
            .field("enabled", &self.enabled)
            .field("cached_sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> EventStore {
        EventStore::new(dir, true)
    }

    #[test]
    fn test_append_assigns_monotone_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let a = store
            .append(AppendEvent::new("s1", "session_started"))
            .unwrap();
        let b = store.append(AppendEvent::new("s1", "tool_call")).unwrap();
        assert!(a.id < b.id);
        assert_eq!(store.len(&"s1".into()), 2);
    }

    #[test]
    fn test_disabled_store_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path(), false);
        let err = store
            .append(AppendEvent::new("s1", "session_started"))
            .unwrap_err();
        assert_eq!(err.code(), "infra_events_store_disabled");
    }

    #[test]
    fn test_list_with_type_and_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        for i in 0..5 {
            store
                .append(
                    AppendEvent::new("s1", "tool_call").with_payload(json!({"index": i})),
                )
                .unwrap();
        }
        store
            .append(AppendEvent::new("s1", "session_shutdown"))
            .unwrap();

        let filter = EventFilter {
            event_type: Some("tool_call".to_owned()),
            last: Some(2),
        };
        let tail = store.list(&"s1".into(), &filter);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].payload.as_ref().unwrap()["index"], 3);
        assert_eq!(tail[1].payload.as_ref().unwrap()["index"], 4);
    }

    #[test]
    fn test_reload_after_cache_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .append(AppendEvent::new("s1", "session_started"))
            .unwrap();
        store.clear_session_cache(&"s1".into());

        let records = store.list(&"s1".into(), &EventFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "session_started");
    }

    #[test]
    fn test_partial_trailing_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path());
            store.append(AppendEvent::new("s1", "a")).unwrap();
            store.append(AppendEvent::new("s1", "b")).unwrap();
        }
        // Simulate a crash mid-append: a truncated final line.
        let path = dir.path().join("events").join("s1.ndjson");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\":\"evt-000").unwrap();

        let store = store(dir.path());
        let records = store.list(&"s1".into(), &EventFilter::default());
        assert_eq!(records.len(), 2);

        // Appending continues from the last valid record.
        let c = store.append(AppendEvent::new("s1", "c")).unwrap();
        assert_eq!(c.id, EventId("evt-00000002".to_owned()));
    }

    #[test]
    fn test_list_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.append(AppendEvent::new("alpha", "x")).unwrap();
        store.append(AppendEvent::new("beta", "x")).unwrap();
        let ids = store.list_session_ids();
        assert_eq!(ids, vec![SessionId::from("alpha"), SessionId::from("beta")]);
    }

    #[test]
    fn test_subscriber_sees_appends() {
        use std::sync::Mutex;

        struct Collect(Mutex<Vec<String>>);
        impl EventSubscriber for Collect {
            fn on_event(&self, record: &EventRecord) {
                self.0.lock().unwrap().push(record.event_type.clone());
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let id = store.subscribe(Arc::clone(&collect) as Arc<dyn EventSubscriber>);

        store.append(AppendEvent::new("s1", "one")).unwrap();
        store.unsubscribe(id);
        store.append(AppendEvent::new("s1", "two")).unwrap();

        assert_eq!(*collect.0.lock().unwrap(), vec!["one".to_owned()]);
    }
}
