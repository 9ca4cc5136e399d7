//! Replication protocol messages.
//!
//! A [`ShardMessage`] is the envelope every shard replica consumes and
//! emits. Field order is stable; encode-then-decode is byte-identical.

use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of a replication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Candidate requesting a vote; `sync_info` carries its last log position.
    Vote,
    /// Vote response; `reject` set when the vote is withheld.
    VoteResp,
    /// Leader pushing entries; `sync_info` carries the preceding position.
    Sync,
    /// Follower acknowledgement; `index` is the match index.
    SyncAck,
    /// Leader liveness ping carrying the commit index.
    Heartbeat,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Vote => "vote",
            MessageType::VoteResp => "vote_resp",
            MessageType::Sync => "sync",
            MessageType::SyncAck => "sync_ack",
            MessageType::Heartbeat => "heartbeat",
        };
        write!(f, "{}", s)
    }
}

/// A single entry in a shard's replicated log.
///
/// `data` is Arc-wrapped so cloning during replication does not copy the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Globally-unique id assigned by the proposing node.
    pub id: u64,
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, id: u64, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            id,
            data: Arc::new(data),
        }
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper for `Arc<Vec<u8>>`: raw bytes on the wire.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Last-known log position of a replica, as seen by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Envelope for all intra-shard replication traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMessage {
    /// Routing key: slot id as string, channel composite key, or `config`.
    pub handler_key: String,
    pub from: NodeId,
    pub to: NodeId,
    pub msg_type: MessageType,
    pub term: Term,
    /// Meaning depends on `msg_type`: first entry index for Sync, match
    /// index for SyncAck, unused otherwise.
    pub index: LogIndex,
    /// Sender's committed index.
    pub commit: LogIndex,
    pub entries: Vec<LogEntry>,
    /// Auxiliary log position (prev entry for Sync, candidate's last for Vote).
    pub sync_info: Option<SyncInfo>,
    /// Set on VoteResp/SyncAck when the request was refused.
    pub reject: bool,
}

impl ShardMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Approximate on-wire size, used for traffic accounting.
    pub fn size(&self) -> u64 {
        let entries: usize = self
            .entries
            .iter()
            .map(|e| e.data.len() + 8 + 8 + 8)
            .sum();
        (self.handler_key.len() + entries + 64) as u64
    }
}
