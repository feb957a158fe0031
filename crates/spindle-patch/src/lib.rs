//! Spindle Patch - File-change tracking around mutation tool calls.
//!
//! Before a mutation tool runs, the tracker snapshots every file the call
//! is about to touch (content bytes plus BLAKE3 hash, with "absent" as a
//! sentinel). When the call ends successfully the same paths are rescanned
//! and the delta becomes a [`PatchSet`] on the session's history; a failed
//! call discards the pending capture. The newest patch set can be rolled
//! back file-by-file, best-effort.
//!
//! Which tools count as mutation tools is a name-based classifier,
//! configurable at construction. Paths are extracted from the
//! conventional argument keys `file_path`, `path`, `paths`, `old_path`,
//! and `new_path`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod diff;
mod tracker;
mod types;

pub use diff::unified_diff;
pub use tracker::{CaptureOutcome, FileChangeTracker, PatchError, PatchResult};
pub use types::{PatchAction, PatchFileChange, PatchSet, RollbackResult};
