use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quorumkv_core::raft::ElectionConfig;

use crate::error::NodeError;

/// Raft timing knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftTimings {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub tick_interval_ms: u64,
    /// Upper bound on one consensus RPC round trip.
    pub rpc_timeout_ms: u64,
    pub max_append_entries: usize,
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            tick_interval_ms: 10,
            rpc_timeout_ms: 500,
            max_append_entries: 64,
        }
    }
}

impl RaftTimings {
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            min_timeout_ms: self.election_timeout_min_ms,
            max_timeout_ms: self.election_timeout_max_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// When to snapshot and how many snapshots to keep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Applied entries since the last snapshot before taking a new one.
    pub threshold: u64,
    pub retain: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threshold: 8192,
            retain: 2,
        }
    }
}

/// Node configuration - built in code or loaded from env
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Consensus address; doubles as the node id.
    pub raft_addr: String,
    pub data_dir: PathBuf,
    /// Allow self-election when no other peer is known.
    pub enable_single: bool,
    /// Text client listener, if any.
    pub client_addr: Option<String>,
    /// Consensus address of an existing member to join at startup.
    pub join: Option<String>,
    pub raft: RaftTimings,
    /// How long the leader waits for a forwarded entry to apply.
    pub apply_timeout_ms: u64,
    /// How long a forwarding caller waits for the leader's answer.
    pub forward_timeout_ms: u64,
    pub snapshot: SnapshotConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            raft_addr: "127.0.0.1:7001".to_string(),
            data_dir: PathBuf::from("data"),
            enable_single: false,
            client_addr: None,
            join: None,
            raft: RaftTimings::default(),
            apply_timeout_ms: 10_000,
            forward_timeout_ms: 15_000,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let raft_addr = std::env::var("RAFT_ADDR").unwrap_or(defaults.raft_addr);
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let enable_single = std::env::var("ENABLE_SINGLE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.enable_single);
        let client_addr = std::env::var("CLIENT_ADDR").ok().filter(|s| !s.is_empty());
        let join = std::env::var("JOIN").ok().filter(|s| !s.is_empty());
        let apply_timeout_ms = std::env::var("APPLY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.apply_timeout_ms);
        let threshold = std::env::var("SNAPSHOT_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.snapshot.threshold);

        Self {
            raft_addr,
            data_dir,
            enable_single,
            client_addr,
            join,
            apply_timeout_ms,
            snapshot: SnapshotConfig {
                threshold,
                ..defaults.snapshot
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.raft_addr.trim().is_empty() {
            return Err(NodeError::Config("raft_addr must not be empty".to_string()));
        }
        if self.raft.election_timeout_min_ms > self.raft.election_timeout_max_ms {
            return Err(NodeError::Config(
                "election timeout range is inverted".to_string(),
            ));
        }
        if self.raft.tick_interval_ms == 0 {
            return Err(NodeError::Config("tick interval must be non-zero".to_string()));
        }
        if self.raft.heartbeat_interval_ms.saturating_mul(2) > self.raft.election_timeout_min_ms {
            return Err(NodeError::Config(
                "heartbeat interval must be well below the election timeout".to_string(),
            ));
        }
        if self.apply_timeout_ms == 0 {
            return Err(NodeError::Config("apply timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Builder for [`NodeConfig`]
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn raft_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.raft_addr = addr.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn enable_single(mut self, enable: bool) -> Self {
        self.config.enable_single = enable;
        self
    }

    pub fn client_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.client_addr = Some(addr.into());
        self
    }

    pub fn join(mut self, addr: impl Into<String>) -> Self {
        self.config.join = Some(addr.into());
        self
    }

    pub fn raft_timings(mut self, timings: RaftTimings) -> Self {
        self.config.raft = timings;
        self
    }

    pub fn apply_timeout(mut self, timeout: Duration) -> Self {
        self.config.apply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.config.forward_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.config.snapshot.threshold = threshold;
        self
    }

    pub fn snapshot_retain(mut self, retain: usize) -> Self {
        self.config.snapshot.retain = retain;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}
