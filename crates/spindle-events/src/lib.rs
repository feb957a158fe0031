//! Spindle Events - Append-only per-session event log.
//!
//! The event log is the spine of the runtime: every state-changing step
//! writes exactly one record here, and all other state (task, truth, tape,
//! schedule, file history) is a projection over it.
//!
//! This crate provides:
//! - [`EventRecord`]: the wire format (`spindle.event.v1`)
//! - [`EventStore`]: durable NDJSON logs under `.spindle/events/` with an
//!   in-memory tail cache
//! - [`SubscriberRegistry`]: synchronous fan-out to in-process observers
//!
//! # Durability
//!
//! Each append flushes to the OS before returning. A crash mid-append may
//! leave a partial final line; on load the store discards the trailing bad
//! line and continues from the last valid record. Records are never
//! mutated or reordered.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod record;
mod store;
mod subscriber;

pub use record::{EVENT_SCHEMA, EventCategory, EventRecord};
pub use store::{AppendEvent, EventError, EventFilter, EventResult, EventStore};
pub use subscriber::{EventSubscriber, SubscriberId, SubscriberRegistry};
