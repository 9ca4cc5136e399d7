//! Configuration for a rookery node.

use crate::error::{Result, RookeryError};
use crate::types::{NodeId, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bootstrap options for the cluster server.
///
/// Callbacks (`on_message`, apply/commit hooks) are not part of the
/// serialized options; they are installed on the server at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Stable identity of this node. Must be non-zero.
    pub node_id: NodeId,
    /// Intra-cluster listen address (`host:port`).
    pub addr: String,
    /// Public api server address, propagated through the config log.
    pub server_addr: String,
    /// Seed node in `<nodeId>@<host:port>` form. Empty means no seed.
    pub seed: String,
    /// Initial cluster members (id -> cluster address). Empty together
    /// with an empty seed means single-node mode.
    pub init_nodes: HashMap<NodeId, String>,
    /// Role of this node.
    pub role: Role,

    /// Number of slots. Immutable after bootstrap.
    pub slot_count: u32,
    /// Replica count per slot.
    pub slot_max_replica_count: u32,
    /// Replica count per channel.
    pub channel_max_replica_count: u32,

    /// Size of the blocking channel-election pool.
    pub channel_election_pool_size: usize,
    /// Size of the non-blocking channel-load pool.
    pub channel_load_pool_size: usize,

    /// How long a propose may stay uncommitted before failing.
    pub propose_timeout: Duration,
    /// Request/response RPC timeout.
    pub req_timeout: Duration,
    /// Age at which an in-flight peer RPC is reaped.
    pub peer_rpc_msg_timeout: Duration,
    /// How often the RPC reaper scans for timed-out requests.
    pub peer_rpc_timeout_scan_interval: Duration,
    /// Heartbeat/election tick for replicas.
    pub check_interval: Duration,

    /// Max entries per Sync message.
    pub sync_limit: u32,
    /// Max entries applied per apply invocation.
    pub commit_limit: u32,
    /// Outbound queue depth per peer.
    pub send_queue_depth: usize,

    /// Data directory; the log DB lives under `<data_dir>/logdb`, the
    /// config snapshot under `<data_dir>/config`.
    pub data_dir: PathBuf,

    /// Observability settings.
    pub observability: ObservabilityOptions,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityOptions {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines instead of plain text.
    pub json_logs: bool,
}

impl Default for ObservabilityOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_id: 1,
            addr: "127.0.0.1:11110".to_string(),
            server_addr: "127.0.0.1:5001".to_string(),
            seed: String::new(),
            init_nodes: HashMap::new(),
            role: Role::Replica,
            slot_count: 64,
            slot_max_replica_count: 3,
            channel_max_replica_count: 3,
            channel_election_pool_size: 10,
            channel_load_pool_size: 100,
            propose_timeout: Duration::from_secs(5),
            req_timeout: Duration::from_secs(10),
            peer_rpc_msg_timeout: Duration::from_secs(10),
            peer_rpc_timeout_scan_interval: Duration::from_secs(1),
            check_interval: Duration::from_millis(250),
            sync_limit: 20,
            commit_limit: 20,
            send_queue_depth: 1024,
            data_dir: PathBuf::from("./rookery-data"),
            observability: ObservabilityOptions::default(),
        }
    }
}

impl Options {
    /// Load options from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RookeryError::Config(format!("failed to read options file: {}", e)))?;
        let opts: Self = serde_json::from_str(&content)
            .map_err(|e| RookeryError::Config(format!("failed to parse options: {}", e)))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Minimal single-node options rooted at `data_dir`.
    pub fn single_node(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Validate bootstrap values. A failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(RookeryError::Config("node_id must be non-zero".into()));
        }
        if self.slot_count == 0 {
            return Err(RookeryError::Config("slot_count must be non-zero".into()));
        }
        if self.slot_max_replica_count == 0 {
            return Err(RookeryError::Config(
                "slot_max_replica_count must be non-zero".into(),
            ));
        }
        if self.channel_max_replica_count == 0 {
            return Err(RookeryError::Config(
                "channel_max_replica_count must be non-zero".into(),
            ));
        }
        if self.sync_limit == 0 {
            return Err(RookeryError::Config("sync_limit must be non-zero".into()));
        }
        if self.commit_limit == 0 {
            return Err(RookeryError::Config("commit_limit must be non-zero".into()));
        }
        if self.channel_load_pool_size == 0 || self.channel_election_pool_size == 0 {
            return Err(RookeryError::Config("pool sizes must be non-zero".into()));
        }
        if !self.seed.trim().is_empty() {
            parse_seed(&self.seed)?;
        }
        Ok(())
    }

    /// Single-node mode: no seed and no initial members.
    pub fn is_single_node(&self) -> bool {
        self.seed.trim().is_empty() && self.init_nodes.is_empty()
    }

    /// The members the configuration document is bootstrapped from. When
    /// `init_nodes` is empty but a seed is configured, the seed and this
    /// node form the initial set.
    pub fn bootstrap_nodes(&self) -> Result<HashMap<NodeId, String>> {
        if !self.init_nodes.is_empty() {
            return Ok(self.init_nodes.clone());
        }
        let mut nodes = HashMap::new();
        if !self.seed.trim().is_empty() {
            let (seed_id, seed_addr) = parse_seed(&self.seed)?;
            nodes.insert(seed_id, seed_addr);
        }
        nodes.insert(self.node_id, self.addr.replace("tcp://", ""));
        Ok(nodes)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logdb")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.data_dir.join("config")
    }
}

/// Parse a `<nodeId>@<host:port>` seed string.
pub fn parse_seed(seed: &str) -> Result<(NodeId, String)> {
    let (id, addr) = seed
        .split_once('@')
        .ok_or_else(|| RookeryError::Config(format!("seed format error: {}", seed)))?;
    let node_id = id
        .parse::<NodeId>()
        .map_err(|_| RookeryError::Config(format!("seed node id invalid: {}", seed)))?;
    if addr.is_empty() {
        return Err(RookeryError::Config(format!("seed addr missing: {}", seed)));
    }
    Ok((node_id, addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn zero_sync_limit_rejected() {
        let opts = Options {
            sync_limit: 0,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(RookeryError::Config(_))));
    }

    #[test]
    fn zero_slot_count_rejected() {
        let opts = Options {
            slot_count: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn seed_parses() {
        let (id, addr) = parse_seed("1@h1:11110").unwrap();
        assert_eq!(id, 1);
        assert_eq!(addr, "h1:11110");
        assert!(parse_seed("bad").is_err());
        assert!(parse_seed("x@h1:1").is_err());
    }

    #[test]
    fn single_node_detection() {
        assert!(Options::default().is_single_node());
        let opts = Options {
            seed: "1@h:1".into(),
            ..Default::default()
        };
        assert!(!opts.is_single_node());
    }

    #[test]
    fn bootstrap_nodes_from_seed() {
        let opts = Options {
            node_id: 4,
            seed: "1@h1:11110".into(),
            ..Default::default()
        };
        let nodes = opts.bootstrap_nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.get(&1).unwrap(), "h1:11110");
        assert!(nodes.contains_key(&4));
    }
}
