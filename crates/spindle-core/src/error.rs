//! Shared error-code vocabulary.
//!
//! Every user-facing API in the runtime returns `Result<T, E>` where `E`
//! exposes a stable machine-readable code through [`ErrorCode`]. The codes
//! follow the conventional prefixes observable in event payloads:
//! `invalid_*`, `conflict_*`, `limit_*`, `state_*`, `infra_*`,
//! `verification_*`, `exec_*`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access to the stable machine-readable code of an error.
pub trait ErrorCode {
    /// The stable code, e.g. `"invalid_cron"` or `"state_intent_not_found"`.
    fn code(&self) -> &'static str;
}

/// A serializable error carried in event payloads and API envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorObject {
    /// Build from any error that exposes a code.
    pub fn from_error<E: ErrorCode + fmt::Display>(err: &E) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Build from raw parts.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    enum SampleError {
        #[error("intent not found: {0}")]
        IntentNotFound(String),
    }

    impl ErrorCode for SampleError {
        fn code(&self) -> &'static str {
            match self {
                Self::IntentNotFound(_) => "state_intent_not_found",
            }
        }
    }

    #[test]
    fn test_error_object_from_error() {
        let err = SampleError::IntentNotFound("i-1".to_owned());
        let obj = ErrorObject::from_error(&err);
        assert_eq!(obj.code, "state_intent_not_found");
        assert_eq!(obj.message, "intent not found: i-1");
    }

    #[test]
    fn test_serde_round_trip() {
        let obj = ErrorObject::new("invalid_cron", "bad expression");
        let json = serde_json::to_string(&obj).unwrap();
        let back: ErrorObject = serde_json::from_str(&json).unwrap();
        assert_eq!(back, obj);
    }
}
