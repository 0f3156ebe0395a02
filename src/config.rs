//! Runtime configuration plus YAML config-file loading for the node binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net::StreamLayer;

/// Limits and placement for individual segments.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Cap on a segment's store file, in bytes.
    pub max_store_bytes: u64,
    /// Cap on a segment's index file, in bytes. Must be at least one entry.
    pub max_index_bytes: u64,
    /// Offset assigned to the first record of a fresh log.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        SegmentConfig {
            max_store_bytes: 1024 * 1024 * 1024,
            max_index_bytes: 10 * 1024 * 1024,
            initial_offset: 0,
        }
    }
}

/// Replication settings for a node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Identifier of this server within the cluster.
    pub local_id: String,
    /// Follower window without leader contact before starting an election.
    pub heartbeat_timeout: Duration,
    /// Candidate window before restarting an election; the actual timeout
    /// is randomized between one and two of these.
    pub election_timeout: Duration,
    /// Leader steps down after this long without majority contact.
    pub leader_lease_timeout: Duration,
    /// Idle interval between leader replication rounds.
    pub commit_timeout: Duration,
    /// How long a proposer waits for its command to commit and apply.
    pub apply_timeout: Duration,
    /// Start the cluster with this node as the single voter.
    pub bootstrap: bool,
    /// Transport handle carrying the shared listener.
    pub stream_layer: Option<StreamLayer>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            local_id: String::new(),
            heartbeat_timeout: Duration::from_secs(1),
            election_timeout: Duration::from_secs(1),
            leader_lease_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(50),
            apply_timeout: Duration::from_secs(10),
            bootstrap: false,
            stream_layer: None,
        }
    }
}

/// Top-level configuration recognized by the core.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub segment: SegmentConfig,
    pub raft: RaftConfig,
}

/// On-disk YAML representation loaded by the node binary and converted
/// into a runtime [`Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Identifier of this server.
    pub node_id: String,
    /// Address the shared listener binds to.
    pub bind_addr: String,
    /// Directory holding `log/` and `raft/`.
    pub data_dir: String,
    #[serde(default)]
    pub bootstrap: bool,
    /// Address of an existing cluster member to join through.
    #[serde(default)]
    pub join_addr: Option<String>,
    #[serde(default)]
    pub segment: SegmentFileConfig,
    #[serde(default)]
    pub timeouts: TimeoutFileConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentFileConfig {
    pub max_store_bytes: Option<u64>,
    pub max_index_bytes: Option<u64>,
    pub initial_offset: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutFileConfig {
    pub heartbeat_ms: Option<u64>,
    pub election_ms: Option<u64>,
    pub leader_lease_ms: Option<u64>,
    pub commit_ms: Option<u64>,
    pub apply_ms: Option<u64>,
}

impl ConfigFile {
    /// Loads and parses a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|err| Error::Config(err.to_string()))
    }

    /// Converts the file contents into a runtime config. The stream layer
    /// is attached by the caller once the listener is bound.
    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        config.raft.local_id = self.node_id.clone();
        config.raft.bootstrap = self.bootstrap;

        if let Some(v) = self.segment.max_store_bytes {
            config.segment.max_store_bytes = v;
        }
        if let Some(v) = self.segment.max_index_bytes {
            config.segment.max_index_bytes = v;
        }
        if let Some(v) = self.segment.initial_offset {
            config.segment.initial_offset = v;
        }

        let t = &self.timeouts;
        if let Some(ms) = t.heartbeat_ms {
            config.raft.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = t.election_ms {
            config.raft.election_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = t.leader_lease_ms {
            config.raft.leader_lease_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = t.commit_ms {
            config.raft.commit_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = t.apply_ms {
            config.raft.apply_timeout = Duration::from_millis(ms);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.segment.max_store_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.segment.max_index_bytes, 10 * 1024 * 1024);
        assert_eq!(config.segment.initial_offset, 0);
        assert!(!config.raft.bootstrap);
        assert!(config.raft.stream_layer.is_none());
    }

    #[test]
    fn test_config_file_round_trip() {
        let yaml = r#"
node_id: "node-1"
bind_addr: "127.0.0.1:9000"
data_dir: "/var/lib/commitlog"
bootstrap: true
segment:
  max_store_bytes: 4096
timeouts:
  heartbeat_ms: 100
  election_ms: 150
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.node_id, "node-1");
        assert!(file.join_addr.is_none());

        let config = file.to_config();
        assert_eq!(config.raft.local_id, "node-1");
        assert!(config.raft.bootstrap);
        assert_eq!(config.segment.max_store_bytes, 4096);
        // Untouched fields keep their defaults.
        assert_eq!(config.segment.max_index_bytes, 10 * 1024 * 1024);
        assert_eq!(config.raft.heartbeat_timeout, Duration::from_millis(100));
        assert_eq!(config.raft.election_timeout, Duration::from_millis(150));
        assert_eq!(config.raft.commit_timeout, Duration::from_millis(50));
    }
}
