/*
 * Copyright (c) 2025 RookDB Project. All rights reserved.
 *
 * RookDB - Distributed document database replication and storage core
 * Built with Rust for superior performance and reliability
 *
 * @file config.rs
 * @brief RookDB node configuration management
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Node-level replication settings; the equivalent of the command line
/// `--replSet` / `--master` / `--slave` surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Replica set name; None means the node does not run as a set member.
    pub replset: Option<String>,
    pub master: bool,
    pub slave: bool,
    /// Config-server-role nodes skip replication checks on writes.
    pub config_server: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub election_timeout_ms: u64,
    pub quorum_check_timeout_ms: u64,
}

impl ReplicationSettings {
    pub fn using_repl_sets(&self) -> bool {
        self.replset.is_some()
    }

    pub fn repl_enabled(&self) -> bool {
        self.using_repl_sets() || self.master || self.slave
    }

    pub fn our_set_name(&self) -> &str {
        self.replset.as_deref().unwrap_or("")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn quorum_check_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_check_timeout_ms)
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            replset: None,
            master: false,
            slave: false,
            config_server: false,
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 10000,
            election_timeout_ms: 10000,
            quorum_check_timeout_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub engine: String,
    pub data_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            engine: "heap".to_string(),
            data_path: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub detailed: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            detailed: false,
        }
    }
}

impl NodeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication.using_repl_sets() && (self.replication.master || self.replication.slave) {
            anyhow::bail!("replset mode cannot be combined with master/slave mode");
        }
        if let Some(name) = &self.replication.replset {
            if name.is_empty() {
                anyhow::bail!("replica set name must not be empty");
            }
        }
        if self.replication.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat interval must be positive");
        }
        if self.replication.election_timeout_ms == 0 {
            anyhow::bail!("election timeout must be positive");
        }
        Ok(())
    }

    pub fn replset(name: &str) -> Self {
        Self {
            replication: ReplicationSettings {
                replset: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
