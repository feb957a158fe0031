//! The workspace PID lock.
//!
//! One process owns a workspace. The PID record at
//! `.spindle/scheduler.pid` is held under an exclusive advisory lock for
//! the lifetime of the runtime and removed on release.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::json;
use tracing::debug;

use spindle_core::now_ms;

/// An exclusively held workspace lock.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    file: File,
}

impl WorkspaceLock {
    /// Acquire the lock, writing the PID record.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when another process holds the lock or the
    /// record cannot be written.
    pub fn acquire(state_dir: &Path, port: Option<u16>) -> std::io::Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join("scheduler.pid");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;

        let record = json!({
            "pid": std::process::id(),
            "host": hostname(),
            "port": port,
            "startedAt": now_ms(),
            "cwd": std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        });
        file.set_len(0)?;
        file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        file.flush()?;

        debug!(path = %path.display(), "workspace lock acquired");
        Ok(Self { path, file })
    }

    /// Release the lock and remove the PID record.
    pub fn release(self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
        debug!(path = %self.path.display(), "workspace lock released");
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_record_and_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WorkspaceLock::acquire(dir.path(), None).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("scheduler.pid")).unwrap();
        let record: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(record["pid"], std::process::id());

        // A second acquisition in the same process fails while held.
        assert!(WorkspaceLock::acquire(dir.path(), None).is_err());

        lock.release();
        assert!(!dir.path().join("scheduler.pid").exists());

        // And succeeds after release.
        WorkspaceLock::acquire(dir.path(), None).unwrap().release();
    }
}
