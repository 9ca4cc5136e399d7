//! Per-shard replication: wire messages, log tail, state, and the driver
//! task.

mod log;
mod message;
mod replica;
mod state;

pub use log::ShardLog;
pub use message::{LogEntry, MessageType, ShardMessage, SyncInfo};
pub use replica::{
    start_replica, ReplicaEvent, ReplicaHandle, ReplicaOptions, ReplicaStatus, ShardSender,
    ShardStateMachine,
};
pub use state::{FollowerProgress, ReplicaRole, ReplicaState, TermState};
