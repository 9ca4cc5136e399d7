//! Channel manager: replicas for dynamically-created channels.
//!
//! Channels come and go with demand; their replicas are registered here
//! after a load resolves the channel's metadata from its owning slot.

use crate::config::Options;
use crate::error::Result;
use crate::hooks::ServerHooks;
use crate::replica::{
    start_replica, LogEntry, ReplicaHandle, ReplicaOptions, ShardMessage, ShardSender,
    ShardStateMachine,
};
use crate::storage::ShardLogStorage;
use crate::types::{ChannelMeta, LogIndex};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Channel entries are opaque messaging payloads; they go straight to the
/// embedding server's hooks.
struct ChannelStateMachine {
    shard: String,
    hooks: ServerHooks,
}

impl ShardStateMachine for ChannelStateMachine {
    fn apply(&mut self, entries: &[LogEntry]) -> Result<LogIndex> {
        let batch_last = entries.last().map(|e| e.index).unwrap_or(0);
        if let Some(on_apply) = &self.hooks.on_apply {
            let applied = on_apply(&self.shard, entries)?;
            if applied < batch_last {
                return Ok(applied);
            }
        }
        Ok(batch_last)
    }

    fn on_commit(&mut self, old: LogIndex, new: LogIndex) {
        if let Some(on_commit) = &self.hooks.on_commit {
            on_commit(&self.shard, old, new);
        }
    }
}

struct ChannelHandle {
    meta: ChannelMeta,
    replica: Arc<ReplicaHandle>,
}

pub struct ChannelManager {
    opts: Arc<Options>,
    storage: Arc<ShardLogStorage>,
    sender: Arc<dyn ShardSender>,
    hooks: ServerHooks,
    shutdown: watch::Receiver<bool>,
    channels: RwLock<HashMap<String, ChannelHandle>>,
}

impl ChannelManager {
    pub fn new(
        opts: Arc<Options>,
        storage: Arc<ShardLogStorage>,
        sender: Arc<dyn ShardSender>,
        hooks: ServerHooks,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            opts,
            storage,
            sender,
            hooks,
            shutdown,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Replica of a loaded channel, if any.
    pub fn get(&self, handler_key: &str) -> Option<Arc<ReplicaHandle>> {
        self.channels
            .read()
            .get(handler_key)
            .map(|h| Arc::clone(&h.replica))
    }

    pub fn meta(&self, handler_key: &str) -> Option<ChannelMeta> {
        self.channels.read().get(handler_key).map(|h| h.meta.clone())
    }

    pub fn loaded_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Register a channel replica from resolved metadata. Re-registering
    /// pushes the new metadata into the existing replica.
    pub async fn register(&self, meta: ChannelMeta) -> Result<Arc<ReplicaHandle>> {
        let handler_key = meta.key.handler_key();
        let (replica, fresh) = {
            let mut channels = self.channels.write();
            match channels.get_mut(&handler_key) {
                Some(handle) => {
                    handle.meta = meta.clone();
                    (Arc::clone(&handle.replica), false)
                }
                None => {
                    let replica = Arc::new(start_replica(
                        ReplicaOptions {
                            node_id: self.opts.node_id,
                            shard: handler_key.clone(),
                            replicas: meta.replicas.clone(),
                            leader_hint: meta.leader,
                            sync_limit: self.opts.sync_limit,
                            commit_limit: self.opts.commit_limit,
                            check_interval: self.opts.check_interval,
                            propose_timeout: self.opts.propose_timeout,
                            ..Default::default()
                        },
                        Arc::clone(&self.storage),
                        Arc::clone(&self.sender),
                        Box::new(ChannelStateMachine {
                            shard: handler_key.clone(),
                            hooks: self.hooks.clone(),
                        }),
                        self.shutdown.clone(),
                    )?);
                    channels.insert(
                        handler_key.clone(),
                        ChannelHandle {
                            meta: meta.clone(),
                            replica: Arc::clone(&replica),
                        },
                    );
                    (replica, true)
                }
            }
        };
        if fresh {
            info!(channel = %handler_key, leader = meta.leader, "channel replica registered");
        }
        // Install the elected leadership, if the metadata carries one.
        replica
            .update_config(meta.replicas, meta.leader, meta.term)
            .await?;
        Ok(replica)
    }

    /// Direct enqueue; the caller has already resolved the replica.
    pub async fn add_message(&self, msg: ShardMessage) -> Result<()> {
        if let Some(replica) = self.get(&msg.handler_key) {
            replica.add_message(msg).await
        } else {
            debug!(key = %msg.handler_key, "message for unloaded channel dropped");
            Ok(())
        }
    }

    /// Unload one channel (idle eviction hook).
    pub async fn unload(&self, handler_key: &str) {
        let handle = self.channels.write().remove(handler_key);
        if let Some(handle) = handle {
            info!(channel = %handler_key, "channel unloaded");
            handle.replica.stop().await;
        }
    }

    pub async fn stop(&self) {
        let handles: Vec<ChannelHandle> =
            self.channels.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.replica.stop().await;
        }
    }
}
