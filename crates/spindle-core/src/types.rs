//! Identifier newtypes.
//!
//! Every identifier in the runtime is an opaque string wrapped in a
//! dedicated newtype so that a session id can never be passed where an
//! intent id is expected. Sessions created by external collaborators
//! (channels, schedulers) bring their own ids, so the wrappers accept
//! arbitrary strings rather than enforcing a UUID shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), Uuid::new_v4()))
            }

            /// View the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// A single agent conversation thread. Owns all events, ledger rows,
    /// patches, and state transitions recorded under it.
    SessionId,
    "ses"
);

string_id!(
    /// A scheduled firing rule belonging to a parent session.
    IntentId,
    "int"
);

string_id!(
    /// One tool invocation within a session turn.
    ToolCallId,
    "tc"
);

string_id!(
    /// An event record in the per-session append log.
    ///
    /// Assigned by the event store; monotone within a session.
    EventId,
    "evt"
);

string_id!(
    /// An evidence ledger row.
    LedgerRowId,
    "led"
);

string_id!(
    /// A write-ahead-log record for an externally triggered turn.
    WalId,
    "wal"
);

string_id!(
    /// An inbound turn (prompt, channel message, scheduled wakeup).
    TurnId,
    "turn"
);

/// A patch set produced by a successful mutation tool call.
///
/// Monotone within a session; assigned by the file-change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSetId(pub u64);

impl fmt::Display for PatchSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_from_str_preserves_value() {
        let id = SessionId::from("child-1");
        assert_eq!(id.as_str(), "child-1");
        assert_eq!(id.to_string(), "child-1");
    }

    #[test]
    fn test_serde_transparent() {
        let id = IntentId::from("intent-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"intent-42\"");
        let back: IntentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_patch_set_id_display() {
        assert_eq!(PatchSetId(7).to_string(), "patch-7");
    }
}
