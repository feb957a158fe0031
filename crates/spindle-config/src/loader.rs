//! Configuration loading.
//!
//! The overlay lives at `.spindle/config.json` relative to the workspace
//! root. A missing file is not an error; a malformed file is.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::types::Config;
use crate::{STATE_DIR, validate};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The overlay file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the overlay file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The overlay file exists but is not valid JSON for [`Config`].
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path of the overlay file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The runtime state directory for a workspace root.
#[must_use]
pub fn state_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(STATE_DIR)
}

/// Load configuration for a workspace.
///
/// Applies the JSON overlay at `.spindle/config.json` over defaults and
/// logs validation warnings. A missing overlay yields the defaults.
///
/// # Errors
///
/// Returns an error if the overlay exists but cannot be read or parsed.
pub fn load_config(workspace_root: &Path) -> ConfigResult<Config> {
    let path = state_dir(workspace_root).join("config.json");

    let config = if path.exists() {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "loaded config overlay");
        config
    } else {
        debug!(path = %path.display(), "no config overlay, using defaults");
        Config::default()
    };

    for warning in validate(&config) {
        tracing::warn!(%warning, "config validation");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_overlay_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path()).unwrap();
        assert!(cfg.events.enabled);
    }

    #[test]
    fn test_overlay_applies() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join(STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(
            state.join("config.json"),
            r#"{"events": {"enabled": false}, "ledger": {"digestWindow": 5}}"#,
        )
        .unwrap();

        let cfg = load_config(dir.path()).unwrap();
        assert!(!cfg.events.enabled);
        assert_eq!(cfg.ledger.digest_window, 5);
        // Sibling field untouched by the overlay keeps its default.
        assert_eq!(cfg.ledger.checkpoint_every_turns, 20);
    }

    #[test]
    fn test_malformed_overlay_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join(STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("config.json"), "{not json").unwrap();

        assert!(matches!(
            load_config(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
