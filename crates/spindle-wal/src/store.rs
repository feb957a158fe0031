//! The WAL store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use spindle_core::{ErrorCode, WalId, now_ms};

use crate::record::{TURN_WAL_SCHEMA, TurnEnvelope, TurnSource, TurnWalRecord, WalStatus};

/// WAL configuration (mirrors `infrastructure.turnWal`).
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Master switch; when off, appends fail with `infra_wal_disabled`.
    pub enabled: bool,
    /// TTL for records without an explicit one.
    pub default_ttl_ms: i64,
    /// Recovery retry cap for pending records.
    pub max_retries: u32,
    /// Terminal records older than this are deleted by `compact`.
    pub compact_after_ms: i64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_ms: 10 * 60 * 1000,
            max_retries: 3,
            compact_after_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Errors raised by the WAL.
#[derive(Debug, Error)]
pub enum WalError {
    /// The WAL is turned off in configuration.
    #[error("turn WAL is disabled")]
    Disabled,

    /// A record file could not be read or written.
    #[error("WAL I/O failed for {path}: {source}")]
    Io {
        /// Record file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("WAL encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// No record with that id.
    #[error("WAL record not found: {0}")]
    NotFound(WalId),

    /// The requested status change would regress the record.
    #[error("illegal WAL transition {from:?} -> {to:?} for {wal_id}")]
    InvalidTransition {
        /// The record.
        wal_id: WalId,
        /// Its current status.
        from: WalStatus,
        /// The requested status.
        to: WalStatus,
    },
}

impl ErrorCode for WalError {
    fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "infra_wal_disabled",
            Self::Io { .. } => "infra_wal_persist_failed",
            Self::Encode(_) => "infra_wal_encode_failed",
            Self::NotFound(_) => "state_wal_not_found",
            Self::InvalidTransition { .. } => "state_wal_invalid_transition",
        }
    }
}

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Options for [`TurnWal::append_pending`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// TTL override.
    pub ttl_ms: Option<i64>,
    /// Idempotence key.
    pub dedupe_key: Option<String>,
}

/// What a recovery scan found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Pending records eligible for retry (attempts below the cap).
    pub retryable: Vec<TurnWalRecord>,
    /// Records expired by this scan (TTL elapsed).
    pub expired: Vec<WalId>,
    /// Pending records past the retry cap, marked failed by this scan.
    pub exhausted: Vec<WalId>,
}

struct Inner {
    records: HashMap<WalId, TurnWalRecord>,
    dedupe: HashMap<String, WalId>,
}

/// The turn write-ahead log.
pub struct TurnWal {
    root: PathBuf,
    config: WalConfig,
    inner: Mutex<Inner>,
}

impl TurnWal {
    /// Open the WAL under a workspace state directory, loading existing
    /// records. Unreadable record files are skipped with a warning.
    #[must_use]
    pub fn open(state_dir: &Path, config: WalConfig) -> Self {
        let root = state_dir.join("turn-wal");
        let mut records = HashMap::new();
        let mut dedupe = HashMap::new();

        if let Ok(sources) = std::fs::read_dir(&root) {
            for source_dir in sources.filter_map(Result::ok) {
                let Ok(files) = std::fs::read_dir(source_dir.path()) else {
                    continue;
                };
                for file in files.filter_map(Result::ok) {
                    match std::fs::read_to_string(file.path())
                        .map_err(|e| e.to_string())
                        .and_then(|raw| {
                            serde_json::from_str::<TurnWalRecord>(&raw).map_err(|e| e.to_string())
                        }) {
                        Ok(record) => {
                            if let Some(key) = &record.dedupe_key {
                                dedupe.insert(key.clone(), record.wal_id.clone());
                            }
                            records.insert(record.wal_id.clone(), record);
                        },
                        Err(err) => {
                            warn!(path = %file.path().display(), error = %err, "unreadable WAL record skipped");
                        },
                    }
                }
            }
        }

        debug!(records = records.len(), "turn WAL loaded");
        Self {
            root,
            config,
            inner: Mutex::new(Inner { records, dedupe }),
        }
    }

    /// Record an inbound turn as pending.
    ///
    /// Idempotent on `dedupe_key`: a second append with the same key
    /// returns the existing record unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error when the WAL is disabled or the record cannot be
    /// persisted.
    pub fn append_pending(
        &self,
        envelope: TurnEnvelope,
        source: TurnSource,
        options: &AppendOptions,
    ) -> WalResult<TurnWalRecord> {
        if !self.config.enabled {
            return Err(WalError::Disabled);
        }

        let mut inner = self.lock();
        if let Some(key) = &options.dedupe_key
            && let Some(existing_id) = inner.dedupe.get(key)
            && let Some(existing) = inner.records.get(existing_id)
        {
            // A terminal record no longer guards the key: a retry of the
            // same run gets a fresh record.
            if !existing.status.is_terminal() {
                return Ok(existing.clone());
            }
        }

        let now = now_ms();
        let record = TurnWalRecord {
            schema: TURN_WAL_SCHEMA.to_owned(),
            wal_id: WalId(format!("wal-{}", Uuid::new_v4())),
            turn_id: envelope.turn_id.clone(),
            session_id: envelope.session_id.clone(),
            channel: envelope.channel.clone(),
            source,
            status: WalStatus::Pending,
            envelope,
            created_at: now,
            updated_at: now,
            attempts: 0,
            ttl_ms: options.ttl_ms.unwrap_or(self.config.default_ttl_ms),
            dedupe_key: options.dedupe_key.clone(),
            error: None,
        };

        self.persist(&record)?;
        if let Some(key) = &record.dedupe_key {
            inner.dedupe.insert(key.clone(), record.wal_id.clone());
        }
        inner.records.insert(record.wal_id.clone(), record.clone());
        Ok(record)
    }

    /// Mark a record inflight. Bumps `attempts`.
    pub fn mark_inflight(&self, wal_id: &WalId) -> WalResult<TurnWalRecord> {
        self.transition(wal_id, WalStatus::Inflight, None)
    }

    /// Mark a record done.
    pub fn mark_done(&self, wal_id: &WalId) -> WalResult<TurnWalRecord> {
        self.transition(wal_id, WalStatus::Done, None)
    }

    /// Mark a record failed with an error message.
    pub fn mark_failed(&self, wal_id: &WalId, error: Option<String>) -> WalResult<TurnWalRecord> {
        self.transition(wal_id, WalStatus::Failed, error)
    }

    /// Mark a record expired.
    pub fn mark_expired(&self, wal_id: &WalId) -> WalResult<TurnWalRecord> {
        self.transition(wal_id, WalStatus::Expired, None)
    }

    /// Every non-terminal record, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<TurnWalRecord> {
        let inner = self.lock();
        let mut records: Vec<TurnWalRecord> = inner
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.created_at, r.wal_id.clone()));
        records
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, wal_id: &WalId) -> Option<TurnWalRecord> {
        self.lock().records.get(wal_id).cloned()
    }

    /// The latest non-terminal record matching a dedupe-key prefix, if
    /// any. Used by the scheduler to detect fires already in progress.
    #[must_use]
    pub fn latest_pending_with_prefix(&self, prefix: &str) -> Option<TurnWalRecord> {
        let inner = self.lock();
        inner
            .records
            .values()
            .filter(|r| {
                !r.status.is_terminal()
                    && r.dedupe_key.as_deref().is_some_and(|k| k.starts_with(prefix))
            })
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Startup recovery pass.
    ///
    /// - `inflight` records past their TTL are marked expired; younger
    ///   ones are left for the current owner to drive to terminal.
    /// - `pending` records past their TTL are expired; those past the
    ///   retry cap are failed; the rest are returned for retry.
    pub fn recover(&self) -> WalResult<RecoveryReport> {
        let now = now_ms();
        let candidates = self.list_pending();
        let mut report = RecoveryReport::default();

        for record in candidates {
            if record.ttl_elapsed(now) {
                self.mark_expired(&record.wal_id)?;
                report.expired.push(record.wal_id);
                continue;
            }
            match record.status {
                WalStatus::Pending => {
                    if record.attempts >= self.config.max_retries {
                        self.mark_failed(
                            &record.wal_id,
                            Some("retry budget exhausted".to_owned()),
                        )?;
                        report.exhausted.push(record.wal_id);
                    } else {
                        report.retryable.push(record);
                    }
                },
                // Within TTL: the owner is (or will be) driving it.
                WalStatus::Inflight => {},
                _ => {},
            }
        }

        Ok(report)
    }

    /// Delete terminal records older than `compact_after_ms`.
    pub fn compact(&self) -> WalResult<usize> {
        let now = now_ms();
        let mut inner = self.lock();
        let doomed: Vec<WalId> = inner
            .records
            .values()
            .filter(|r| {
                r.status.is_terminal()
                    && now.saturating_sub(r.updated_at) > self.config.compact_after_ms
            })
            .map(|r| r.wal_id.clone())
            .collect();

        for wal_id in &doomed {
            if let Some(record) = inner.records.remove(wal_id) {
                if let Some(key) = &record.dedupe_key {
                    inner.dedupe.remove(key);
                }
                let path = self.record_path(&record);
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "compact could not delete record file");
                }
            }
        }
        Ok(doomed.len())
    }

    fn transition(
        &self,
        wal_id: &WalId,
        to: WalStatus,
        error: Option<String>,
    ) -> WalResult<TurnWalRecord> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(wal_id)
            .ok_or_else(|| WalError::NotFound(wal_id.clone()))?;

        if !record.status.can_transition_to(to) {
            return Err(WalError::InvalidTransition {
                wal_id: wal_id.clone(),
                from: record.status,
                to,
            });
        }

        if record.status == WalStatus::Pending {
            record.attempts += 1;
        }
        record.status = to;
        record.updated_at = now_ms();
        if error.is_some() {
            record.error = error;
        }

        let snapshot = record.clone();
        drop(inner);
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn record_path(&self, record: &TurnWalRecord) -> PathBuf {
        self.root
            .join(record.source.as_str())
            .join(format!("{}.json", record.wal_id))
    }

    fn persist(&self, record: &TurnWalRecord) -> WalResult<()> {
        let path = self.record_path(record);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WalError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let raw = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, raw).map_err(|source| WalError::Io { path, source })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TurnWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnWal")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(turn: &str) -> TurnEnvelope {
        TurnEnvelope {
            turn_id: turn.into(),
            session_id: "s1".into(),
            channel: "schedule".to_owned(),
            payload: json!({"text": "wake up"}),
        }
    }

    fn wal(dir: &Path) -> TurnWal {
        TurnWal::open(dir, WalConfig::default())
    }

    #[test]
    fn test_dedupe_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let options = AppendOptions {
            ttl_ms: None,
            dedupe_key: Some("schedule:i1:1".to_owned()),
        };

        let first = wal
            .append_pending(envelope("t1"), TurnSource::Schedule, &options)
            .unwrap();
        let second = wal
            .append_pending(envelope("t2"), TurnSource::Schedule, &options)
            .unwrap();
        assert_eq!(first.wal_id, second.wal_id);
        assert_eq!(wal.list_pending().len(), 1);
    }

    #[test]
    fn test_terminal_record_releases_dedupe_key() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let options = AppendOptions {
            ttl_ms: None,
            dedupe_key: Some("schedule:i1:1".to_owned()),
        };

        let first = wal
            .append_pending(envelope("t1"), TurnSource::Schedule, &options)
            .unwrap();
        wal.mark_inflight(&first.wal_id).unwrap();
        wal.mark_failed(&first.wal_id, Some("boom".to_owned())).unwrap();

        // A retry of the same run is a new record, not the dead one.
        let second = wal
            .append_pending(envelope("t1"), TurnSource::Schedule, &options)
            .unwrap();
        assert_ne!(first.wal_id, second.wal_id);
        assert_eq!(second.status, WalStatus::Pending);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let record = wal
            .append_pending(envelope("t1"), TurnSource::Channel, &AppendOptions::default())
            .unwrap();

        let inflight = wal.mark_inflight(&record.wal_id).unwrap();
        assert_eq!(inflight.attempts, 1);
        wal.mark_done(&record.wal_id).unwrap();

        let err = wal.mark_failed(&record.wal_id, None).unwrap_err();
        assert_eq!(err.code(), "state_wal_invalid_transition");
    }

    #[test]
    fn test_records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let wal_id = {
            let wal = wal(dir.path());
            let record = wal
                .append_pending(
                    envelope("t1"),
                    TurnSource::Schedule,
                    &AppendOptions {
                        ttl_ms: None,
                        dedupe_key: Some("k1".to_owned()),
                    },
                )
                .unwrap();
            record.wal_id
        };

        let wal = wal(dir.path());
        let loaded = wal.get(&wal_id).unwrap();
        assert_eq!(loaded.status, WalStatus::Pending);
        // The dedupe index is rebuilt too.
        let again = wal
            .append_pending(
                envelope("t9"),
                TurnSource::Schedule,
                &AppendOptions {
                    ttl_ms: None,
                    dedupe_key: Some("k1".to_owned()),
                },
            )
            .unwrap();
        assert_eq!(again.wal_id, wal_id);
    }

    #[test]
    fn test_recovery_expires_old_inflight() {
        let dir = tempfile::tempdir().unwrap();
        let wal = TurnWal::open(
            dir.path(),
            WalConfig {
                default_ttl_ms: 0,
                ..WalConfig::default()
            },
        );
        let record = wal
            .append_pending(envelope("t1"), TurnSource::Channel, &AppendOptions::default())
            .unwrap();
        wal.mark_inflight(&record.wal_id).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let report = wal.recover().unwrap();
        assert_eq!(report.expired, vec![record.wal_id.clone()]);
        assert_eq!(wal.get(&record.wal_id).unwrap().status, WalStatus::Expired);
    }

    #[test]
    fn test_recovery_returns_retryable_pending() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal(dir.path());
        let record = wal
            .append_pending(envelope("t1"), TurnSource::Gateway, &AppendOptions::default())
            .unwrap();

        let report = wal.recover().unwrap();
        assert_eq!(report.retryable.len(), 1);
        assert_eq!(report.retryable[0].wal_id, record.wal_id);
        assert!(report.expired.is_empty());
    }

    #[test]
    fn test_compact_deletes_old_terminal_records() {
        let dir = tempfile::tempdir().unwrap();
        let wal = TurnWal::open(
            dir.path(),
            WalConfig {
                compact_after_ms: 0,
                ..WalConfig::default()
            },
        );
        let record = wal
            .append_pending(envelope("t1"), TurnSource::Channel, &AppendOptions::default())
            .unwrap();
        wal.mark_inflight(&record.wal_id).unwrap();
        wal.mark_done(&record.wal_id).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let deleted = wal.compact().unwrap();
        assert_eq!(deleted, 1);
        assert!(wal.get(&record.wal_id).is_none());
        assert!(
            !dir.path()
                .join("turn-wal")
                .join("channel")
                .join(format!("{}.json", record.wal_id))
                .exists()
        );
    }

    #[test]
    fn test_disabled_wal_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let wal = TurnWal::open(
            dir.path(),
            WalConfig {
                enabled: false,
                ..WalConfig::default()
            },
        );
        let err = wal
            .append_pending(envelope("t1"), TurnSource::Channel, &AppendOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "infra_wal_disabled");
    }
}
