//! Daemon configuration.
//!
//! An optional JSON config file supplies the socket and state-file paths;
//! CLI flags override it, and anything unset falls back to the defaults.
//! An unreadable config is a warning, not a fatal error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mrtd/config.json";

/// Default durable state file.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/mrtd/state.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub state_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            socket_path: PathBuf::from(mrt_api::DEFAULT_SOCKET_PATH),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, falling back to defaults if the file is missing
    /// or unparseable.
    pub fn load(path: &Path) -> Self {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(_) => return DaemonConfig::default(),
        };
        match serde_json::from_slice(&data) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not parse config, using defaults");
                DaemonConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("nope.json"));
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, br#"{"socket_path": "/tmp/test-mrtd.sock"}"#).unwrap();

        let config = DaemonConfig::load(&path);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test-mrtd.sock"));
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, b"{oops").unwrap();
        assert_eq!(DaemonConfig::load(&path), DaemonConfig::default());
    }
}
