//! Ledger row types and chain linking.

use serde::{Deserialize, Serialize};
use spindle_core::{ContentHash, LedgerRowId, SessionId, TimestampMs};

/// The ternary outcome stored with each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The tool result supports the claim it evidences.
    Pass,
    /// The tool result contradicts it.
    Fail,
    /// Neither.
    Inconclusive,
}

impl Verdict {
    /// Canonical name, as bound into the chain hash.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Inconclusive => "inconclusive",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a row is live evidence or a compaction checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// A tool result.
    Evidence,
    /// A synthetic row standing in for a compacted prefix.
    Checkpoint,
}

/// One row in the evidence ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRow {
    /// Row id, unique across the ledger.
    pub id: LedgerRowId,
    /// Owning session.
    pub session_id: SessionId,
    /// Session turn the result belongs to.
    pub turn: u64,
    /// Active skill at the time, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    /// Tool that produced the result.
    pub tool: String,
    /// Short rendering of the arguments.
    pub args_summary: String,
    /// Short rendering of the output.
    pub output_summary: String,
    /// Hash of the full output text.
    pub output_hash: ContentHash,
    /// Hash of the session's previous row (zero for the chain root).
    pub previous_hash: ContentHash,
    /// `H(previousHash ∥ id ∥ outputHash ∥ verdict)`.
    pub hash: ContentHash,
    /// Evidence verdict.
    pub verdict: Verdict,
    /// Free-form metadata (e.g. touched files, exit codes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: TimestampMs,
    /// Evidence or checkpoint.
    pub kind: RowKind,
}

impl LedgerRow {
    /// Compute the chain hash for the given constituents.
    #[must_use]
    pub fn chain_hash(
        previous_hash: &ContentHash,
        id: &LedgerRowId,
        output_hash: &ContentHash,
        verdict: Verdict,
    ) -> ContentHash {
        ContentHash::hash_multi(&[
            previous_hash.as_bytes(),
            id.as_str().as_bytes(),
            output_hash.as_bytes(),
            verdict.as_str().as_bytes(),
        ])
    }

    /// Check that this row's hash matches its contents.
    #[must_use]
    pub fn hash_is_consistent(&self) -> bool {
        Self::chain_hash(&self.previous_hash, &self.id, &self.output_hash, self.verdict)
            == self.hash
    }

    /// Check that this row follows another in the chain.
    #[must_use]
    pub fn follows(&self, previous: &LedgerRow) -> bool {
        self.previous_hash == previous.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, previous: ContentHash, verdict: Verdict) -> LedgerRow {
        let id = LedgerRowId::from(id);
        let output_hash = ContentHash::hash(b"output");
        let hash = LedgerRow::chain_hash(&previous, &id, &output_hash, verdict);
        LedgerRow {
            id,
            session_id: "s1".into(),
            turn: 1,
            skill: None,
            tool: "exec".to_owned(),
            args_summary: "ls".to_owned(),
            output_summary: "ok".to_owned(),
            output_hash,
            previous_hash: previous,
            hash,
            verdict,
            metadata: None,
            timestamp: 0,
            kind: RowKind::Evidence,
        }
    }

    #[test]
    fn test_chain_linking() {
        let first = row("led-1", ContentHash::zero(), Verdict::Pass);
        let second = row("led-2", first.hash, Verdict::Fail);
        assert!(second.follows(&first));
        assert!(!first.follows(&second));
    }

    #[test]
    fn test_tampering_detected() {
        let mut r = row("led-1", ContentHash::zero(), Verdict::Pass);
        assert!(r.hash_is_consistent());
        r.verdict = Verdict::Fail;
        assert!(!r.hash_is_consistent());
    }

    #[test]
    fn test_verdict_changes_hash() {
        let id = LedgerRowId::from("led-1");
        let out = ContentHash::hash(b"x");
        assert_ne!(
            LedgerRow::chain_hash(&ContentHash::zero(), &id, &out, Verdict::Pass),
            LedgerRow::chain_hash(&ContentHash::zero(), &id, &out, Verdict::Fail)
        );
    }
}
