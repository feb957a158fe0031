//! Spindle Ledger - Chain-linked evidence ledger.
//!
//! Every tool result is appended here as a row whose `hash` covers the
//! previous row's hash, the row id, the output hash, and the verdict. The
//! chain is tamper-evident: rewriting a past row invalidates the chain
//! tail. It is not tamper-proof against the owning process: treat it as
//! an integrity check, not a notarized audit log.
//!
//! Periodic compaction condenses a session's prefix into a synthetic
//! checkpoint row whose hash becomes the new chain root, so verification
//! keeps working across compaction.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod row;
mod store;

pub use row::{LedgerRow, RowKind, Verdict};
pub use store::{
    ChainIssue, ChainVerification, CompactOptions, DigestOptions, LedgerAppend, LedgerError,
    LedgerQuery, LedgerResult, LedgerStore,
};
