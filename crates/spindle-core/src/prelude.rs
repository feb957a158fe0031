//! Prelude module - commonly used types for convenient import.
//!
//! Use `use spindle_core::prelude::*;` to import all essential types.

// Identifiers
pub use crate::{EventId, IntentId, LedgerRowId, PatchSetId, SessionId, ToolCallId, TurnId, WalId};

// Hashing
pub use crate::ContentHash;

// Time
pub use crate::{TimestampMs, now_ms};

// Errors
pub use crate::{ErrorCode, ErrorObject};

// Tokens
pub use crate::estimate_tokens;
