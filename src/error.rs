//! Error types for the rookery cluster core.
//!
//! A single unified error enum [`RookeryError`] covers storage, transport,
//! replication, scheduling and bootstrap failures, with a [`Result`] alias
//! used throughout the crate.

use std::io;
use thiserror::Error;

use crate::types::NodeId;

/// Main error type for cluster operations.
#[derive(Error, Debug)]
pub enum RookeryError {
    // Storage errors
    #[error("out of order append: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("storage corrupt: {0}")]
    Corrupt(String),

    // Transport errors
    #[error("peer not registered: {0}")]
    PeerUnknown(NodeId),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("send queue full for peer {0}")]
    Overflow(NodeId),

    #[error("operation canceled")]
    Canceled,

    // Replication errors
    #[error("stale term: message term {msg} < current term {current}")]
    StaleTerm { msg: u64, current: u64 },

    #[error("log mismatch at index {index}: expected term {expected}, got {got}")]
    LogMismatch { index: u64, expected: u64, got: u64 },

    #[error("not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    #[error("propose not committed in time")]
    ProposeTimeout,

    // Scheduler errors
    #[error("task pool saturated: {0}")]
    PoolSaturated(String),

    // Bootstrap errors
    #[error("configuration error: {0}")]
    Config(String),

    // Wire errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RookeryError {
    /// Check if the error is transient and the operation worth retrying.
    /// Transport and storage hiccups heal through heartbeat/resync; the
    /// state machine keeps going.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RookeryError::NotLeader { .. }
                | RookeryError::Timeout(_)
                | RookeryError::Overflow(_)
                | RookeryError::ProposeTimeout
                | RookeryError::PoolSaturated(_)
        )
    }
}

impl From<rocksdb::Error> for RookeryError {
    fn from(e: rocksdb::Error) -> Self {
        RookeryError::Corrupt(e.to_string())
    }
}

impl From<bincode::Error> for RookeryError {
    fn from(e: bincode::Error) -> Self {
        RookeryError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RookeryError {
    fn from(e: serde_json::Error) -> Self {
        RookeryError::Serialization(e.to_string())
    }
}

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, RookeryError>;
