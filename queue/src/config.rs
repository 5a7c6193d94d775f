//! Drop-directory configuration.
//!
//! The queue runs over a pair of shared directories under one base path:
//! submitters rename archives into `input/`, the backend drops result
//! archives into `output/`. A dev deployment gets its own `input_dev/` and
//! `output_dev/` so test studies never mix with production work units.
//! Resolving a submitter identity to its base path belongs to the identity
//! collaborator, not to this crate.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read the queue config file")]
    Read(#[from] std::io::Error),
    #[error("failed to parse the queue config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("drop directories failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    // base path holding the shared drop directories
    pub base_dir: PathBuf,
    // route to the dev drop directories instead of the production ones
    #[serde(default)]
    pub dev: bool,
}

impl QueueConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dev: false,
        }
    }

    pub fn dev(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            dev: true,
        }
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = File::open(path.as_ref())?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// directory submitters publish archives into
    pub fn input_dir(&self) -> PathBuf {
        self.base_dir
            .join(if self.dev { "input_dev" } else { "input" })
    }

    /// directory the backend drops result archives into
    pub fn output_dir(&self) -> PathBuf {
        self.base_dir
            .join(if self.dev { "output_dev" } else { "output" })
    }

    /// verify both drop directories are usable before touching the queue
    ///
    /// All problems are logged before the single error returns, so a user
    /// gets the full picture in one go.
    pub fn preflight_checks(&self) -> Result<(), ConfigError> {
        let mut contains_error = false;
        for dir in [self.input_dir(), self.output_dir()] {
            if !dir.is_dir() {
                error!(dir = ?dir, "drop directory is missing or not a directory");
                contains_error = true;
            }
        }
        if contains_error {
            Err(ConfigError::Preflight)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn routes_to_dev_directories() {
        let config = QueueConfig::dev("/data/drop");
        assert_eq!(config.input_dir(), PathBuf::from("/data/drop/input_dev"));
        assert_eq!(config.output_dir(), PathBuf::from("/data/drop/output_dev"));

        let config = QueueConfig::new("/data/drop");
        assert_eq!(config.input_dir(), PathBuf::from("/data/drop/input"));
        assert_eq!(config.output_dir(), PathBuf::from("/data/drop/output"));
    }

    #[test]
    fn loads_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.yaml");
        fs::write(&path, "base_dir: /data/drop\ndev: true\n").unwrap();
        let config = QueueConfig::from_yaml(&path).unwrap();
        assert!(config.dev);
        assert_eq!(config.base_dir, PathBuf::from("/data/drop"));

        fs::write(&path, "base_dir: /data/drop\nbogus: 1\n").unwrap();
        assert!(matches!(
            QueueConfig::from_yaml(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn preflight_wants_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::new(dir.path());
        assert!(matches!(
            config.preflight_checks(),
            Err(ConfigError::Preflight)
        ));

        fs::create_dir_all(config.input_dir()).unwrap();
        fs::create_dir_all(config.output_dir()).unwrap();
        assert!(config.preflight_checks().is_ok());
    }
}
