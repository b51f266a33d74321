//! Config loading and persistence.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Did, Limits, PeerId};
use crate::pipeline::FinalityConfig;
use crate::snapshot::SnapshotPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub replication: ReplicationConfig,
    pub snapshot: SnapshotPolicy,
    pub finality: FinalityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub listen_addr: String,
    pub max_connections: Option<usize>,
    pub peers: Vec<PeerConfig>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_connections: Some(32),
            peers: Vec::new(),
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer: PeerId,
    pub addr: String,
    /// Controller DID when known ahead of a stake proof (allow-listing).
    pub controller: Option<Did>,
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

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

pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> Error {
    Error::Config(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let peer = PeerConfig {
            peer: PeerId::from_public_key(&[7u8; 32]),
            addr: "127.0.0.1:9000".to_string(),
            controller: Some(Did::from_public_key(&[8u8; 32])),
        };
        let cfg = Config {
            limits: Limits::default(),
            replication: ReplicationConfig {
                listen_addr: "127.0.0.1:9999".to_string(),
                max_connections: Some(7),
                peers: vec![peer],
                backoff_base_ms: 111,
                backoff_max_ms: 222,
            },
            snapshot: SnapshotPolicy::default(),
            finality: FinalityConfig::default(),
        };
        write_config(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.replication.listen_addr, "127.0.0.1:9999");
        assert_eq!(loaded.replication.peers.len(), 1);
        assert_eq!(loaded.limits, Limits::default());
    }

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let cfg = load_or_init(&path);
        assert_eq!(cfg.replication.listen_addr, "127.0.0.1:0");
        // load_or_init persists defaults for the next run.
        assert!(path.exists());
    }
}
