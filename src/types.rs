//! Core type definitions for the rookery cluster.
//!
//! Identifiers are plain integer aliases; the composite channel key and
//! the node-scoped log id generator live here because every layer of the
//! cluster needs them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Cluster node identifier. Stable across restarts and address changes.
pub type NodeId = u64;

/// Replication election epoch. Term 0 means "unknown"; real terms start at 1.
pub type Term = u64;

/// Position in a shard's replicated log. Dense and monotone per shard.
pub type LogIndex = u64;

/// Fixed slot identifier in `[0, slot_count)`.
pub type SlotId = u32;

/// Shard key of the cluster configuration log.
pub const CONFIG_SHARD_KEY: &str = "config";

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full member: hosts slot and channel replicas.
    Replica,
    /// Routing-only member: forwards traffic, hosts no shards.
    Proxy,
}

impl Role {
    pub fn is_replica(&self) -> bool {
        matches!(self, Role::Replica)
    }
}

/// A cluster member as recorded in the committed configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node id.
    pub id: NodeId,
    /// Intra-cluster wire address (`host:port`).
    pub cluster_addr: String,
    /// Public api server address, propagated for clients.
    pub api_addr: String,
    /// Role of the node.
    pub role: Role,
    /// Whether the node is believed reachable.
    pub online: bool,
}

/// A slot as recorded in the committed configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: SlotId,
    /// Last known election term of the slot.
    pub term: Term,
    /// Replica set, `slot_max_replica_count` node ids.
    pub replicas: Vec<NodeId>,
    /// Last known leader among `replicas`.
    pub leader: NodeId,
}

/// Channel fingerprint: `(channel_id, channel_type)` identifies a logical
/// topic and deduplicates in-flight loads and elections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub channel_id: String,
    pub channel_type: u8,
}

impl ChannelKey {
    pub fn new(channel_id: impl Into<String>, channel_type: u8) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
        }
    }

    /// Composite handler key, used to address the channel's replica.
    pub fn handler_key(&self) -> String {
        format!("{}#{}", self.channel_id, self.channel_type)
    }

    /// Parse a composite handler key back into a fingerprint. Channel ids
    /// may themselves contain `#`, so the type is taken from the last
    /// separator.
    pub fn from_handler_key(key: &str) -> Option<Self> {
        let (id, ty) = key.rsplit_once('#')?;
        if id.is_empty() {
            return None;
        }
        let channel_type = ty.parse::<u8>().ok()?;
        Some(Self {
            channel_id: id.to_string(),
            channel_type,
        })
    }

    /// The slot that owns this channel's metadata.
    pub fn owning_slot(&self, slot_count: u32) -> SlotId {
        slot_for_key(&self.channel_id, slot_count)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.channel_id, self.channel_type)
    }
}

/// Map a key onto its owning slot.
pub fn slot_for_key(key: &str, slot_count: u32) -> SlotId {
    debug_assert!(slot_count > 0);
    crc32c::crc32c(key.as_bytes()) % slot_count
}

/// Channel metadata, owned by the channel's slot and replicated through
/// the slot's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub key: ChannelKey,
    /// Replica set, `channel_max_replica_count` node ids drawn from the
    /// owning slot's replicas.
    pub replicas: Vec<NodeId>,
    /// Elected channel leader, 0 when none has been elected yet.
    pub leader: NodeId,
    /// Election term of the channel.
    pub term: Term,
}

const ID_EPOCH_MILLIS: u64 = 1_577_836_800_000; // 2020-01-01T00:00:00Z
const ID_NODE_BITS: u64 = 10;
const ID_SEQ_BITS: u64 = 12;

/// Node-scoped generator of globally-unique log ids.
///
/// Snowflake layout: 41 bits of milliseconds since a fixed epoch, 10 bits
/// of node id, 12 bits of per-millisecond sequence. Ids are strictly
/// increasing per node.
#[derive(Debug)]
pub struct LogIdGenerator {
    node_bits: u64,
    state: Mutex<IdState>,
}

#[derive(Debug)]
struct IdState {
    last_millis: u64,
    seq: u64,
}

impl LogIdGenerator {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_bits: (node_id & ((1 << ID_NODE_BITS) - 1)) << ID_SEQ_BITS,
            state: Mutex::new(IdState {
                last_millis: 0,
                seq: 0,
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = current_millis();
        if now < state.last_millis {
            // Clock went backwards; keep issuing from the last seen
            // millisecond so ids stay monotone.
            now = state.last_millis;
        }
        if now == state.last_millis {
            state.seq = (state.seq + 1) & ((1 << ID_SEQ_BITS) - 1);
            if state.seq == 0 {
                // Sequence exhausted within the millisecond.
                now += 1;
            }
        } else {
            state.seq = 0;
        }
        state.last_millis = now;
        (now.saturating_sub(ID_EPOCH_MILLIS) << (ID_NODE_BITS + ID_SEQ_BITS))
            | self.node_bits
            | state.seq
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(ID_EPOCH_MILLIS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_round_trip() {
        let key = ChannelKey::new("room-42", 1);
        assert_eq!(key.handler_key(), "room-42#1");
        let parsed = ChannelKey::from_handler_key("room-42#1").unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn channel_key_with_separator_in_id() {
        let key = ChannelKey::new("a#b", 2);
        let parsed = ChannelKey::from_handler_key(&key.handler_key()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn channel_key_rejects_garbage() {
        assert!(ChannelKey::from_handler_key("").is_none());
        assert!(ChannelKey::from_handler_key("no-separator").is_none());
        assert!(ChannelKey::from_handler_key("#1").is_none());
        assert!(ChannelKey::from_handler_key("x#abc").is_none());
    }

    #[test]
    fn slot_mapping_is_stable() {
        let a = slot_for_key("room-42", 64);
        let b = slot_for_key("room-42", 64);
        assert_eq!(a, b);
        assert!(a < 64);
    }

    #[test]
    fn log_ids_are_unique_and_increasing() {
        let gen = LogIdGenerator::new(7);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn log_ids_embed_node() {
        let a = LogIdGenerator::new(1).next_id();
        let b = LogIdGenerator::new(2).next_id();
        assert_ne!(a & (0x3ff << 12), b & (0x3ff << 12));
    }
}
