//! User-supplied callbacks installed on the cluster server.

use crate::error::Result;
use crate::replica::LogEntry;
use crate::transport::Frame;
use crate::types::LogIndex;
use std::sync::Arc;

/// Handler for frames the cluster core does not understand.
pub type OnMessageHook = Arc<dyn Fn(Frame) + Send + Sync>;

/// Consumer of committed shard entries; returns the new applied index.
/// The first argument is the shard's handler key.
pub type OnApplyHook = Arc<dyn Fn(&str, &[LogEntry]) -> Result<LogIndex> + Send + Sync>;

/// Observer of commit advancement per shard.
pub type OnCommitHook = Arc<dyn Fn(&str, LogIndex, LogIndex) + Send + Sync>;

/// The optional hooks a server embeds.
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub on_message: Option<OnMessageHook>,
    pub on_apply: Option<OnApplyHook>,
    pub on_commit: Option<OnCommitHook>,
}
