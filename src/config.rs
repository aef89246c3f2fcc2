//! WolfShard Configuration
//!
//! This module provides configuration structures for the WolfShard
//! shard replication manager.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfShard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfShardConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Write replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Digest tree configuration
    #[serde(default)]
    pub digest: DigestConfig,

    /// Reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Known peers (participant id -> replication address)
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Shards this node participates in
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique participant identifier
    pub id: String,

    /// Address to bind for replication traffic
    pub bind_address: String,

    /// Data directory for registry state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// A peer participant reachable over the replication transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

/// Initial participant layout for a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: String,
    pub leader: String,
    #[serde(default)]
    pub followers: Vec<String>,
}

/// Write replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Per-operation acknowledgement timeout in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Largest sequence gap a follower may lag before it is suspect
    #[serde(default = "default_max_sequence_gap")]
    pub max_sequence_gap: u64,

    /// How long a follower buffers out-of-order operations before self-reporting
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,

    /// Buffered operations per transaction before an intermediate commit is injected
    #[serde(default = "default_intermediate_commit_threshold")]
    pub intermediate_commit_threshold: usize,

    /// Version chains are compacted every this many sequence numbers; 0 disables
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval: u64,
}

/// Digest tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Sub-ranges produced when a divergent range is subdivided
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Ranges holding at most this many entries are diffed document by document
    #[serde(default = "default_leaf_rows")]
    pub leaf_rows: u64,

    /// Rebuilds of one shard tolerated inside the window before escalating
    #[serde(default = "default_rebuild_storm_threshold")]
    pub rebuild_storm_threshold: usize,

    /// Rebuild storm window in seconds
    #[serde(default = "default_rebuild_window_secs")]
    pub rebuild_window_secs: u64,

    /// Comparison batch TTL in seconds
    #[serde(default = "default_batch_ttl_secs")]
    pub batch_ttl_secs: u64,
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Consecutive suspicion signals tolerated before a follower is dropped
    #[serde(default = "default_suspicion_budget")]
    pub suspicion_budget: u32,

    /// Resync attempt TTL in milliseconds
    #[serde(default = "default_resync_ttl_ms")]
    pub resync_ttl_ms: u64,

    /// Maximum comparison passes per resync attempt
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,

    /// Documents pushed per repair batch
    #[serde(default = "default_repair_batch_size")]
    pub repair_batch_size: usize,

    /// Delay before a discarded resync attempt restarts, in milliseconds
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_ack_timeout_ms() -> u64 {
    2000
}

fn default_max_sequence_gap() -> u64 {
    64
}

fn default_gap_timeout_ms() -> u64 {
    500
}

fn default_intermediate_commit_threshold() -> usize {
    1000
}

fn default_compaction_interval() -> u64 {
    256
}

fn default_fanout() -> usize {
    16
}

fn default_leaf_rows() -> u64 {
    64
}

fn default_rebuild_storm_threshold() -> usize {
    3
}

fn default_rebuild_window_secs() -> u64 {
    60
}

fn default_batch_ttl_secs() -> u64 {
    300
}

fn default_suspicion_budget() -> u32 {
    2
}

fn default_resync_ttl_ms() -> u64 {
    600_000
}

fn default_max_passes() -> usize {
    16
}

fn default_repair_batch_size() -> usize {
    500
}

fn default_restart_backoff_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfshard")
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_sequence_gap: default_max_sequence_gap(),
            gap_timeout_ms: default_gap_timeout_ms(),
            intermediate_commit_threshold: default_intermediate_commit_threshold(),
            compaction_interval: default_compaction_interval(),
        }
    }
}

impl ReplicationConfig {
    /// Acknowledgement timeout as Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Follower gap buffering bound as Duration
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    /// Whether advancing from `before` to `after` crosses a compaction point
    pub fn compaction_due(&self, before: u64, after: u64) -> bool {
        self.compaction_interval > 0
            && after / self.compaction_interval > before / self.compaction_interval
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            fanout: default_fanout(),
            leaf_rows: default_leaf_rows(),
            rebuild_storm_threshold: default_rebuild_storm_threshold(),
            rebuild_window_secs: default_rebuild_window_secs(),
            batch_ttl_secs: default_batch_ttl_secs(),
        }
    }
}

impl DigestConfig {
    /// Rebuild storm window as Duration
    pub fn rebuild_window(&self) -> Duration {
        Duration::from_secs(self.rebuild_window_secs)
    }

    /// Comparison batch TTL as Duration
    pub fn batch_ttl(&self) -> Duration {
        Duration::from_secs(self.batch_ttl_secs)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            suspicion_budget: default_suspicion_budget(),
            resync_ttl_ms: default_resync_ttl_ms(),
            max_passes: default_max_passes(),
            repair_batch_size: default_repair_batch_size(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

impl ReconcileConfig {
    /// Resync TTL as Duration
    pub fn resync_ttl(&self) -> Duration {
        Duration::from_millis(self.resync_ttl_ms)
    }

    /// Restart backoff as Duration
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfShardConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string
    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: WolfShardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.digest.fanout < 2 {
            return Err(crate::Error::Config("digest.fanout must be at least 2".into()));
        }

        if self.reconcile.suspicion_budget == 0 {
            return Err(crate::Error::Config(
                "reconcile.suspicion_budget must be at least 1".into(),
            ));
        }

        for shard in &self.shards {
            if shard.followers.contains(&shard.leader) {
                return Err(crate::Error::Config(format!(
                    "shard {}: leader {} is also listed as follower",
                    shard.id, shard.leader
                )));
            }
            for participant in std::iter::once(&shard.leader).chain(shard.followers.iter()) {
                if participant != &self.node.id && self.peer_address(participant).is_none() {
                    return Err(crate::Error::Config(format!(
                        "shard {}: participant {} has no [[peers]] entry",
                        shard.id, participant
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up a peer's replication address
    pub fn peer_address(&self, id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.address.as_str())
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Shards led by this node
    pub fn led_shards(&self) -> impl Iterator<Item = &ShardConfig> {
        self.shards.iter().filter(move |s| s.leader == self.node.id)
    }

    /// Shards this node follows
    pub fn followed_shards(&self) -> impl Iterator<Item = &ShardConfig> {
        self.shards
            .iter()
            .filter(move |s| s.followers.contains(&self.node.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/wolfshard"

[replication]
ack_timeout_ms = 1500

[[peers]]
id = "node-2"
address = "node-2:7700"

[[peers]]
id = "node-3"
address = "node-3:7700"

[[shards]]
id = "s1"
leader = "node-1"
followers = ["node-2", "node-3"]

[[shards]]
id = "s2"
leader = "node-2"
followers = ["node-1"]
"#;

    #[test]
    fn test_parse_config() {
        let config = WolfShardConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.replication.ack_timeout(), Duration::from_millis(1500));
        assert_eq!(config.replication.max_sequence_gap, 64);
        assert_eq!(config.digest.fanout, 16);
        assert_eq!(config.led_shards().count(), 1);
        assert_eq!(config.followed_shards().count(), 1);
        assert_eq!(config.peer_address("node-3"), Some("node-3:7700"));
        assert_eq!(config.reconcile.resync_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_compaction_points() {
        let mut replication = ReplicationConfig {
            compaction_interval: 4,
            ..Default::default()
        };
        assert!(!replication.compaction_due(0, 3));
        assert!(replication.compaction_due(3, 4));
        assert!(replication.compaction_due(2, 9));
        assert!(!replication.compaction_due(4, 7));

        replication.compaction_interval = 0;
        assert!(!replication.compaction_due(0, 1000));
    }

    #[test]
    fn test_unknown_participant_rejected() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:7700"

[[shards]]
id = "s1"
leader = "node-1"
followers = ["node-9"]
"#;
        assert!(matches!(
            WolfShardConfig::parse(toml),
            Err(crate::Error::Config(_))
        ));
    }
}
