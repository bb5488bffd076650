//! Run Settings
//!
//! Defaults for directories and timing, optionally overridden by a
//! `reconflow.yaml` file and then by command-line flags.
//!
//! # Example YAML Format
//!
//! ```yaml
//! templates_dir: /opt/reconflow/workflows
//! reports_dir: /var/lib/reconflow/reports
//! default_template: default
//! kill_grace_ms: 50
//! output_settle_timeout_secs: 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "reconflow.yaml";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub templates_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub default_template: String,
    /// Pause between SIGTERM and SIGKILL of a tool's process group
    pub kill_grace_ms: u64,
    pub output_settle_timeout_secs: u64,
    pub output_poll_interval_ms: u64,
    pub privileged_watchdog_secs: u64,
    pub watchdog_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("workflows"),
            reports_dir: PathBuf::from("reports"),
            default_template: "default".to_string(),
            kill_grace_ms: 50,
            output_settle_timeout_secs: 30,
            output_poll_interval_ms: 250,
            privileged_watchdog_secs: 2,
            watchdog_secs: 3,
        }
    }
}

impl Settings {
    /// Reads settings from a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// `explicit` must exist; otherwise `reconflow.yaml` is used if present.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, LoadError> {
        match explicit {
            Some(path) => Self::load(path),
            None if Path::new(CONFIG_FILE_NAME).is_file() => Self::load(CONFIG_FILE_NAME),
            None => Ok(Self::default()),
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn output_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.output_settle_timeout_secs)
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms.max(1))
    }

    pub fn privileged_watchdog(&self) -> Duration {
        Duration::from_secs(self.privileged_watchdog_secs)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.templates_dir, PathBuf::from("workflows"));
        assert_eq!(settings.kill_grace(), Duration::from_millis(50));
        assert_eq!(settings.output_settle_timeout(), Duration::from_secs(30));
        assert_eq!(settings.output_poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.privileged_watchdog(), Duration::from_secs(2));
        assert_eq!(settings.watchdog(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "reports_dir: /data/scans\nkill_grace_ms: 100\n").unwrap();

        let settings = Settings::load_or_default(Some(&path)).unwrap();
        assert_eq!(settings.reports_dir, PathBuf::from("/data/scans"));
        assert_eq!(settings.kill_grace_ms, 100);
        assert_eq!(settings.default_template, "default");
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let temp_dir = tempdir().unwrap();
        let err = Settings::load_or_default(Some(&temp_dir.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn test_malformed_file_is_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "kill_grace_ms: [not, a, number]\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(LoadError::Yaml { .. })));
    }
}
