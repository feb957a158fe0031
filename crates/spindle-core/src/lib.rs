//! Spindle Core - Foundation types for the Spindle workspace runtime.
//!
//! This crate provides:
//! - Newtype identifiers used throughout the runtime
//! - Content hashing for the evidence chain and patch snapshots
//! - Millisecond-epoch timestamp helpers
//! - The shared error-code vocabulary surfaced at API boundaries
//! - Token estimation used by every budget computation

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod error;
pub mod hash;
pub mod time;
pub mod token;
pub mod types;

pub use error::{ErrorCode, ErrorObject};
pub use hash::ContentHash;
pub use time::{TimestampMs, now_ms};
pub use token::estimate_tokens;
pub use types::{EventId, IntentId, LedgerRowId, PatchSetId, SessionId, ToolCallId, TurnId, WalId};
