//! Synchronous subscriber registry.
//!
//! Subscribers (the scheduler, metrics) are invoked on the append path,
//! after the record is durable and after per-session locks are released.
//! A panicking subscriber is isolated and logged; it can never corrupt the
//! log or take down the appender.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{error, trace};

use crate::record::EventRecord;

/// Handle for unregistering a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A synchronous observer of appended events.
pub trait EventSubscriber: Send + Sync {
    /// Called once per appended record, in append order.
    fn on_event(&self, record: &EventRecord);

    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "subscriber"
    }
}

/// Registry of synchronous subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<dyn EventSubscriber>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; returns the handle for [`unregister`](Self::unregister).
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.insert(id, subscriber);
        id
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Notify every subscriber, isolating panics.
    pub fn notify(&self, record: &EventRecord) {
        trace!(event_type = %record.event_type, "notifying subscribers");
        for entry in &self.subscribers {
            let subscriber = Arc::clone(entry.value());
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| subscriber.on_event(record)))
            {
                let what = panic
                    .downcast_ref::<&str>()
                    .map_or_else(|| "non-string panic".to_owned(), ToString::to_string);
                error!(
                    subscriber = subscriber.name(),
                    event_type = %record.event_type,
                    panic = %what,
                    "subscriber panicked; isolated"
                );
            }
        }
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventSubscriber for Recorder {
        fn on_event(&self, record: &EventRecord) {
            self.seen.lock().unwrap().push(record.event_type.clone());
        }
    }

    struct Bomb;

    impl EventSubscriber for Bomb {
        fn on_event(&self, _record: &EventRecord) {
            panic!("boom");
        }

        fn name(&self) -> &str {
            "bomb"
        }
    }

    fn record(event_type: &str) -> EventRecord {
        EventRecord {
            id: "evt-1".into(),
            session_id: "s1".into(),
            event_type: event_type.to_owned(),
            timestamp: 0,
            turn: None,
            payload: None,
        }
    }

    #[test]
    fn test_register_notify_unregister() {
        let registry = SubscriberRegistry::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let id = registry.register(Arc::clone(&recorder) as Arc<dyn EventSubscriber>);

        registry.notify(&record("a"));
        registry.unregister(id);
        registry.notify(&record("b"));

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a".to_owned()]);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let registry = SubscriberRegistry::new();
        registry.register(Arc::new(Bomb));
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        registry.register(Arc::clone(&recorder) as Arc<dyn EventSubscriber>);

        // The bomb must not prevent delivery to the recorder.
        registry.notify(&record("x"));
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }
}
