//! The evidence ledger store.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use spindle_core::{
    ContentHash, ErrorCode, LedgerRowId, SessionId, estimate_tokens, now_ms,
};

use crate::row::{LedgerRow, RowKind, Verdict};

/// Errors raised by the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger file could not be read or written.
    #[error("ledger I/O failed for {path}: {source}")]
    Io {
        /// Ledger file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A row could not be encoded.
    #[error("ledger encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for LedgerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "infra_ledger_append_failed",
            Self::Encode(_) => "infra_ledger_encode_failed",
        }
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Input to [`LedgerStore::append`].
#[derive(Debug, Clone)]
pub struct LedgerAppend {
    /// Owning session.
    pub session_id: SessionId,
    /// Session turn.
    pub turn: u64,
    /// Active skill, if any.
    pub skill: Option<String>,
    /// Tool that produced the result.
    pub tool: String,
    /// Short rendering of the arguments.
    pub args_summary: String,
    /// Short rendering of the output.
    pub output_summary: String,
    /// Full output text; only its hash is stored.
    pub full_output: String,
    /// Evidence verdict.
    pub verdict: Verdict,
    /// Free-form metadata.
    pub metadata: Option<Value>,
}

/// Options for [`LedgerStore::compact_session`].
#[derive(Debug, Clone)]
pub struct CompactOptions {
    /// Rows to keep verbatim at the tail.
    pub keep_last: usize,
    /// Why the compaction happened (stored on the checkpoint row).
    pub reason: String,
}

/// Options for [`LedgerStore::build_digest`].
#[derive(Debug, Clone)]
pub struct DigestOptions {
    /// Number of recent rows considered.
    pub window: usize,
    /// Token budget for the rendered digest.
    pub max_tokens: usize,
}

/// Filter for [`LedgerStore::query`].
#[derive(Debug, Clone, Default)]
pub struct LedgerQuery {
    /// Match rows that touched this file (metadata `files` array or args).
    pub file: Option<String>,
    /// Match rows recorded under this skill.
    pub skill: Option<String>,
    /// Match rows with this verdict.
    pub verdict: Option<Verdict>,
    /// Match rows from this tool.
    pub tool: Option<String>,
    /// Return only the trailing N matches.
    pub last: Option<usize>,
}

/// One broken link found by [`LedgerStore::verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIssue {
    /// Index of the offending row within the session.
    pub index: usize,
    /// Id of the offending row.
    pub row_id: LedgerRowId,
    /// What is wrong with it.
    pub detail: String,
}

/// Result of a chain verification pass.
#[derive(Debug, Clone)]
pub struct ChainVerification {
    /// True when every link holds.
    pub valid: bool,
    /// Broken links, oldest first.
    pub issues: Vec<ChainIssue>,
}

struct Inner {
    sessions: HashMap<SessionId, Vec<LedgerRow>>,
    next_seq: u64,
}

/// Chain-linked evidence ledger persisted at `.spindle/ledger.ndjson`.
pub struct LedgerStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl LedgerStore {
    /// Open the ledger under a workspace state directory, loading any
    /// existing rows. A malformed trailing line is discarded.
    #[must_use]
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join("ledger.ndjson");
        let mut sessions: HashMap<SessionId, Vec<LedgerRow>> = HashMap::new();
        let mut count = 0u64;

        if let Ok(file) = std::fs::File::open(&path) {
            for (index, line) in BufReader::new(file).lines().enumerate() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LedgerRow>(&line) {
                    Ok(row) => {
                        sessions.entry(row.session_id.clone()).or_default().push(row);
                        count += 1;
                    },
                    Err(err) => {
                        warn!(line = index, error = %err, "malformed ledger line discarded");
                        break;
                    },
                }
            }
        }

        debug!(path = %path.display(), rows = count, "ledger loaded");
        Self {
            path,
            inner: Mutex::new(Inner {
                sessions,
                next_seq: count,
            }),
        }
    }

    /// Append a tool result, linking it into the session's chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the row cannot be persisted.
    pub fn append(&self, input: LedgerAppend) -> LedgerResult<LedgerRow> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let id = LedgerRowId(format!("led-{:08}", inner.next_seq));
        inner.next_seq += 1;

        let previous_hash = inner
            .sessions
            .get(&input.session_id)
            .and_then(|rows| rows.last())
            .map_or_else(ContentHash::zero, |last| last.hash);

        let output_hash = ContentHash::hash(input.full_output.as_bytes());
        let hash = LedgerRow::chain_hash(&previous_hash, &id, &output_hash, input.verdict);

        let row = LedgerRow {
            id,
            session_id: input.session_id.clone(),
            turn: input.turn,
            skill: input.skill,
            tool: input.tool,
            args_summary: input.args_summary,
            output_summary: input.output_summary,
            output_hash,
            previous_hash,
            hash,
            verdict: input.verdict,
            metadata: input.metadata,
            timestamp: now_ms(),
            kind: RowKind::Evidence,
        };

        self.append_line(&row)?;
        inner
            .sessions
            .entry(input.session_id)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    /// Condense a session's prefix into a checkpoint row.
    ///
    /// Keeps the trailing `keep_last` rows verbatim. With fewer than
    /// `keep_last` rows this is a no-op. The checkpoint inherits the last
    /// compacted row's `hash`, so the surviving suffix still verifies.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewritten ledger cannot be persisted.
    pub fn compact_session(
        &self,
        session_id: &SessionId,
        options: &CompactOptions,
    ) -> LedgerResult<Option<LedgerRow>> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let seq = inner.next_seq;
        let Some(rows) = inner.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if rows.len() <= options.keep_last {
            return Ok(None);
        }

        let split = rows.len() - options.keep_last;
        let compacted: Vec<LedgerRow> = rows.drain(..split).collect();
        let last = compacted
            .last()
            .cloned()
            .unwrap_or_else(|| unreachable!("split > 0"));

        let summary: String = compacted
            .iter()
            .map(|r| format!("{} {} {}\n", r.turn, r.tool, r.verdict))
            .collect();

        let checkpoint = LedgerRow {
            id: LedgerRowId(format!("led-{seq:08}")),
            session_id: session_id.clone(),
            turn: last.turn,
            skill: None,
            tool: "ledger_checkpoint".to_owned(),
            args_summary: options.reason.clone(),
            output_summary: format!("compacted {} rows", compacted.len()),
            output_hash: ContentHash::hash(summary.as_bytes()),
            previous_hash: compacted[0].previous_hash,
            // The compacted tail's hash becomes the new chain root.
            hash: last.hash,
            verdict: Verdict::Inconclusive,
            metadata: None,
            timestamp: now_ms(),
            kind: RowKind::Checkpoint,
        };

        rows.insert(0, checkpoint.clone());
        inner.next_seq += 1;

        self.rewrite_all(&inner)?;
        Ok(Some(checkpoint))
    }

    /// All rows for a session, oldest first.
    #[must_use]
    pub fn session_rows(&self, session_id: &SessionId) -> Vec<LedgerRow> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.sessions.get(session_id).cloned().unwrap_or_default()
    }

    /// Filter recent rows.
    #[must_use]
    pub fn query(&self, session_id: &SessionId, query: &LedgerQuery) -> Vec<LedgerRow> {
        let rows = self.session_rows(session_id);
        let matching: Vec<LedgerRow> = rows
            .into_iter()
            .filter(|row| {
                query.skill.as_ref().is_none_or(|s| row.skill.as_deref() == Some(s))
                    && query.verdict.is_none_or(|v| row.verdict == v)
                    && query.tool.as_ref().is_none_or(|t| &row.tool == t)
                    && query.file.as_ref().is_none_or(|f| Self::touches_file(row, f))
            })
            .collect();

        match query.last {
            Some(n) if matching.len() > n => matching[matching.len() - n..].to_vec(),
            _ => matching,
        }
    }

    /// Render a bounded-token rolling window for context injection.
    #[must_use]
    pub fn build_digest(&self, session_id: &SessionId, options: &DigestOptions) -> String {
        let rows = self.session_rows(session_id);
        let window_start = rows.len().saturating_sub(options.window);

        let mut lines: Vec<String> = Vec::new();
        let mut tokens = 0usize;
        // Newest first so the budget cuts the oldest entries.
        for row in rows[window_start..].iter().rev() {
            let line = match row.kind {
                RowKind::Evidence => format!(
                    "t{} {} [{}] {}",
                    row.turn, row.tool, row.verdict, row.output_summary
                ),
                RowKind::Checkpoint => {
                    format!("t{} checkpoint: {}", row.turn, row.output_summary)
                },
            };
            let cost = estimate_tokens(&line);
            if tokens + cost > options.max_tokens {
                break;
            }
            tokens += cost;
            lines.push(line);
        }

        lines.reverse();
        lines.join("\n")
    }

    /// Walk a session's chain and report broken links.
    #[must_use]
    pub fn verify_chain(&self, session_id: &SessionId) -> ChainVerification {
        let rows = self.session_rows(session_id);
        let mut issues = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            // Checkpoint rows carry a forwarded hash, not a computed one.
            if row.kind == RowKind::Evidence && !row.hash_is_consistent() {
                issues.push(ChainIssue {
                    index,
                    row_id: row.id.clone(),
                    detail: "row hash does not match contents".to_owned(),
                });
            }
            if index > 0 && !row.follows(&rows[index - 1]) {
                issues.push(ChainIssue {
                    index,
                    row_id: row.id.clone(),
                    detail: "previousHash does not match prior row".to_owned(),
                });
            }
        }

        ChainVerification {
            valid: issues.is_empty(),
            issues,
        }
    }

    fn touches_file(row: &LedgerRow, file: &str) -> bool {
        let in_metadata = row
            .metadata
            .as_ref()
            .and_then(|m| m.get("files"))
            .and_then(Value::as_array)
            .is_some_and(|files| files.iter().any(|f| f.as_str() == Some(file)));
        in_metadata || row.args_summary.contains(file)
    }

    fn append_line(&self, row: &LedgerRow) -> LedgerResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let line = serde_json::to_string(row)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(|source| LedgerError::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn rewrite_all(&self, inner: &Inner) -> LedgerResult<()> {
        let mut session_ids: Vec<&SessionId> = inner.sessions.keys().collect();
        session_ids.sort();

        let mut buffer = String::new();
        for session_id in session_ids {
            for row in &inner.sessions[session_id] {
                buffer.push_str(&serde_json::to_string(row)?);
                buffer.push('\n');
            }
        }

        let tmp = self.path.with_extension("ndjson.tmp");
        std::fs::write(&tmp, buffer).map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append_input(session: &str, tool: &str, verdict: Verdict) -> LedgerAppend {
        LedgerAppend {
            session_id: session.into(),
            turn: 1,
            skill: None,
            tool: tool.to_owned(),
            args_summary: format!("{tool} args"),
            output_summary: "ok".to_owned(),
            full_output: format!("{tool} full output"),
            verdict,
            metadata: None,
        }
    }

    #[test]
    fn test_chain_links_consecutive_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());

        let a = store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
        let b = store.append(append_input("s1", "read", Verdict::Pass)).unwrap();
        assert_eq!(b.previous_hash, a.hash);
        assert!(store.verify_chain(&"s1".into()).valid);
    }

    #[test]
    fn test_sessions_have_independent_chains() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());

        store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
        let other = store.append(append_input("s2", "exec", Verdict::Pass)).unwrap();
        assert!(other.previous_hash.is_zero());
    }

    #[test]
    fn test_reload_preserves_chain() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LedgerStore::open(dir.path());
            store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
            store.append(append_input("s1", "read", Verdict::Fail)).unwrap();
        }
        let store = LedgerStore::open(dir.path());
        assert_eq!(store.session_rows(&"s1".into()).len(), 2);
        assert!(store.verify_chain(&"s1".into()).valid);

        // New rows continue the loaded chain.
        let c = store.append(append_input("s1", "test", Verdict::Pass)).unwrap();
        assert_eq!(c.id, LedgerRowId::from("led-00000002"));
        assert!(store.verify_chain(&"s1".into()).valid);
    }

    #[test]
    fn test_compaction_preserves_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());
        for i in 0..6 {
            let verdict = if i % 2 == 0 { Verdict::Pass } else { Verdict::Fail };
            store.append(append_input("s1", "exec", verdict)).unwrap();
        }

        let checkpoint = store
            .compact_session(
                &"s1".into(),
                &CompactOptions {
                    keep_last: 2,
                    reason: "turn cadence".to_owned(),
                },
            )
            .unwrap()
            .expect("compaction should produce a checkpoint");

        let rows = store.session_rows(&"s1".into());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, RowKind::Checkpoint);
        assert_eq!(rows[0].id, checkpoint.id);
        assert!(store.verify_chain(&"s1".into()).valid);
    }

    #[test]
    fn test_compaction_with_few_rows_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());
        store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();

        let result = store
            .compact_session(
                &"s1".into(),
                &CompactOptions {
                    keep_last: 5,
                    reason: "x".to_owned(),
                },
            )
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.session_rows(&"s1".into()).len(), 1);
    }

    #[test]
    fn test_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());
        store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
        store.append(append_input("s1", "test", Verdict::Fail)).unwrap();
        store
            .append(LedgerAppend {
                metadata: Some(serde_json::json!({"files": ["src/a.rs"]})),
                ..append_input("s1", "edit", Verdict::Pass)
            })
            .unwrap();

        let fails = store.query(
            &"s1".into(),
            &LedgerQuery {
                verdict: Some(Verdict::Fail),
                ..LedgerQuery::default()
            },
        );
        assert_eq!(fails.len(), 1);
        assert_eq!(fails[0].tool, "test");

        let touching = store.query(
            &"s1".into(),
            &LedgerQuery {
                file: Some("src/a.rs".to_owned()),
                ..LedgerQuery::default()
            },
        );
        assert_eq!(touching.len(), 1);
        assert_eq!(touching[0].tool, "edit");
    }

    #[test]
    fn test_digest_respects_token_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());
        for _ in 0..20 {
            store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
        }

        let digest = store.build_digest(
            &"s1".into(),
            &DigestOptions {
                window: 20,
                max_tokens: 30,
            },
        );
        assert!(!digest.is_empty());
        assert!(spindle_core::estimate_tokens(&digest) <= 40);
        // Newest entries survive the cut.
        assert!(digest.lines().count() < 20);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::open(dir.path());
        store.append(append_input("s1", "exec", Verdict::Pass)).unwrap();
        store.append(append_input("s1", "read", Verdict::Pass)).unwrap();

        {
            let mut inner = store.inner.lock().unwrap();
            let rows = inner.sessions.get_mut(&"s1".into()).unwrap();
            rows[0].verdict = Verdict::Fail;
        }

        let verification = store.verify_chain(&"s1".into());
        assert!(!verification.valid);
        assert_eq!(verification.issues[0].index, 0);
    }
}
