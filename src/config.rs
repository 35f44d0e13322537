//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{JournalSpec, Limits};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Failure-domain zone of this process.
    pub zone: String,
    /// Process name within the zone.
    pub suffix: String,
    pub listen_addr: String,
    pub coord_prefix: String,
    /// Root directory of the bundled filesystem fragment store, if any.
    pub store_root: Option<PathBuf>,
    pub limits: Limits,
    pub logging: LoggingConfig,
    /// Journals created and self-assigned at startup (single-node
    /// deployments; clusters assign through the coordination store).
    pub journals: Vec<JournalSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zone: "local".to_string(),
            suffix: "broker".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            coord_prefix: "/plume".to_string(),
            store_root: None,
            limits: Limits::default(),
            logging: LoggingConfig::default(),
            journals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
    /// Directory for rolling log files; stderr-only when absent.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
            file_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Load the config, or write and return defaults if it does not exist.
pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Write {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.display().to_string(),
        reason,
    };
    let dir = path
        .parent()
        .ok_or_else(|| write_err("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_err(e.to_string()))?;
    fs::write(temp.path(), data).map_err(|e| write_err(e.to_string()))?;
    temp.persist(path).map_err(|e| write_err(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JournalName;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.zone = "us-east".to_string();
        cfg.suffix = "broker-1".to_string();
        cfg.listen_addr = "127.0.0.1:9999".to_string();
        cfg.store_root = Some(dir.path().join("fragments"));
        cfg.journals = vec![JournalSpec::new(JournalName::parse("a/journal").unwrap())];

        write_config(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.zone, "us-east");
        assert_eq!(loaded.listen_addr, "127.0.0.1:9999");
        assert_eq!(loaded.journals.len(), 1);
        assert_eq!(loaded.journals[0].name.as_str(), "a/journal");
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/config.toml");
        let cfg = load_or_init(&path);
        assert_eq!(cfg.coord_prefix, "/plume");
        assert!(path.exists());
    }
}
