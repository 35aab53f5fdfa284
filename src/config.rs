use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::TICKER_INTERVAL_MS;

/// Name of the config file looked up in a node's working directory.
pub const CONFIG_FILE: &str = "ballot.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Unique node name inside the cluster.
    pub id: String,
    pub bind_address: String,
    pub bind_port: u16,
    /// Number of nodes that must be present before the first election.
    pub expect: usize,
    /// Addresses (host:port) of nodes to join on startup.
    pub peer_list: Vec<String>,
    /// Multiplier applied to every timeout and ticker interval. Slow hosts use > 1.0.
    pub performance: f64,
    /// Hex-encoded symmetric key for the transport. Empty disables encryption.
    pub encrypt: String,
    /// Upper bound on cluster size, used to size the inbound queues.
    pub max_nodes: usize,
    /// Consecutive heartbeat rounds below quorum a leader tolerates before stepping down.
    pub max_sub_quorum_cycles: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: String::new(),
            bind_address: "0.0.0.0".to_string(),
            bind_port: 7946,
            expect: 1,
            peer_list: vec![],
            performance: 1.0,
            encrypt: String::new(),
            max_nodes: 100,
            max_sub_quorum_cycles: 3,
        }
    }
}

impl Config {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// Reads and validates `ballot.json` from the given working directory.
    pub fn load(working_dir: &Path) -> Result<Self, ConfigError> {
        let path = working_dir.join(CONFIG_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("id must not be empty".into()));
        }
        if self.expect == 0 {
            return Err(ConfigError::Invalid("expect must be at least 1".into()));
        }
        if !(self.performance.is_finite() && self.performance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "performance must be a positive number, got {}",
                self.performance
            )));
        }
        if TICKER_INTERVAL_MS as f64 * self.performance < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "performance {} scales the {TICKER_INTERVAL_MS} ms ticker below 1 ms",
                self.performance
            )));
        }
        if self.max_nodes < self.expect {
            return Err(ConfigError::Invalid(format!(
                "max_nodes ({}) must not be smaller than expect ({})",
                self.max_nodes, self.expect
            )));
        }
        if self.max_sub_quorum_cycles == 0 {
            return Err(ConfigError::Invalid(
                "max_sub_quorum_cycles must be at least 1".into(),
            ));
        }
        self.secret_key()?;
        Ok(())
    }

    /// Decoded encryption key, `None` when encryption is disabled.
    pub fn secret_key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        if self.encrypt.is_empty() {
            return Ok(None);
        }
        let key = hex::decode(&self.encrypt)
            .map_err(|e| ConfigError::Invalid(format!("encrypt is not valid hex: {e}")))?;
        match key.len() {
            16 | 24 | 32 => Ok(Some(key)),
            n => Err(ConfigError::Invalid(format!(
                "encrypt must decode to 16, 24 or 32 bytes, got {n}"
            ))),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}
