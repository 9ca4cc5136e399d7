//! Slot manager: hosts a replica for every slot assigned to this node.
//!
//! Slot logs carry two kinds of entries: channel-metadata records owned
//! by the cluster core, and opaque application payloads handed to the
//! embedding server's apply hook.

use crate::config::Options;
use crate::error::{Result, RookeryError};
use crate::event::ClusterState;
use crate::hooks::ServerHooks;
use crate::replica::{
    start_replica, LogEntry, ReplicaHandle, ReplicaOptions, ReplicaStatus, ShardMessage,
    ShardSender, ShardStateMachine,
};
use crate::storage::ShardLogStorage;
use crate::types::{ChannelMeta, LogIndex, SlotId, SlotInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Entry payload of a slot's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotCommand {
    /// Channel metadata write, applied into the channel-meta store.
    SetChannelMeta(ChannelMeta),
    /// Opaque application payload, surfaced through the apply hook.
    App(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl SlotCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Applies a slot's committed entries.
struct SlotStateMachine {
    slot: SlotId,
    shard: String,
    storage: Arc<ShardLogStorage>,
    hooks: ServerHooks,
}

impl ShardStateMachine for SlotStateMachine {
    fn apply(&mut self, entries: &[LogEntry]) -> Result<LogIndex> {
        let mut app_entries = Vec::new();
        for entry in entries {
            match SlotCommand::decode(entry.data_bytes()) {
                Ok(SlotCommand::SetChannelMeta(meta)) => {
                    self.storage.put_channel_meta(self.slot, &meta)?;
                }
                Ok(SlotCommand::App(data)) => {
                    app_entries.push(LogEntry::new(entry.term, entry.index, entry.id, data));
                }
                Err(e) => {
                    warn!(slot = self.slot, index = entry.index, error = %e, "undecodable slot entry");
                }
            }
        }

        let batch_last = entries.last().map(|e| e.index).unwrap_or(0);
        if let Some(on_apply) = &self.hooks.on_apply {
            if !app_entries.is_empty() {
                let applied = on_apply(&self.shard, &app_entries)?;
                // The hook may consume a prefix; the rest is re-applied.
                if applied < batch_last {
                    return Ok(applied);
                }
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

struct SlotHandle {
    info: SlotInfo,
    replica: Arc<ReplicaHandle>,
}

pub struct SlotManager {
    opts: Arc<Options>,
    storage: Arc<ShardLogStorage>,
    sender: Arc<dyn ShardSender>,
    hooks: ServerHooks,
    shutdown: watch::Receiver<bool>,
    slots: RwLock<HashMap<SlotId, SlotHandle>>,
}

impl SlotManager {
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
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Host a slot, or push an updated assignment into its replica.
    pub async fn add_or_update(&self, info: &SlotInfo) -> Result<()> {
        let existing = {
            let slots = self.slots.read();
            slots.get(&info.id).map(|h| (h.info.clone(), Arc::clone(&h.replica)))
        };

        match existing {
            Some((old, replica)) => {
                if old != *info {
                    replica
                        .update_config(info.replicas.clone(), info.leader, info.term)
                        .await?;
                    if let Some(handle) = self.slots.write().get_mut(&info.id) {
                        handle.info = info.clone();
                    }
                }
                Ok(())
            }
            None => {
                let shard = info.id.to_string();
                let replica = start_replica(
                    ReplicaOptions {
                        node_id: self.opts.node_id,
                        shard: shard.clone(),
                        replicas: info.replicas.clone(),
                        leader_hint: info.leader,
                        sync_limit: self.opts.sync_limit,
                        commit_limit: self.opts.commit_limit,
                        check_interval: self.opts.check_interval,
                        propose_timeout: self.opts.propose_timeout,
                        ..Default::default()
                    },
                    Arc::clone(&self.storage),
                    Arc::clone(&self.sender),
                    Box::new(SlotStateMachine {
                        slot: info.id,
                        shard,
                        storage: Arc::clone(&self.storage),
                        hooks: self.hooks.clone(),
                    }),
                    self.shutdown.clone(),
                )?;
                // Seed the externally-assigned leadership.
                replica
                    .update_config(info.replicas.clone(), info.leader, info.term)
                    .await?;
                info!(slot = info.id, leader = info.leader, "slot hosted");
                self.slots.write().insert(
                    info.id,
                    SlotHandle {
                        info: info.clone(),
                        replica: Arc::new(replica),
                    },
                );
                Ok(())
            }
        }
    }

    /// Route an inbound slot frame by its handler key.
    pub async fn add_message(&self, msg: ShardMessage) -> Result<()> {
        let Ok(slot_id) = msg.handler_key.parse::<SlotId>() else {
            warn!(key = %msg.handler_key, "malformed slot key, message dropped");
            return Ok(());
        };
        let replica = self.replica(slot_id);
        match replica {
            Some(replica) => replica.add_message(msg).await,
            None => {
                warn!(slot = slot_id, "message for unhosted slot dropped");
                Ok(())
            }
        }
    }

    pub fn replica(&self, id: SlotId) -> Option<Arc<ReplicaHandle>> {
        self.slots.read().get(&id).map(|h| Arc::clone(&h.replica))
    }

    pub fn info(&self, id: SlotId) -> Option<SlotInfo> {
        self.slots.read().get(&id).map(|h| h.info.clone())
    }

    pub fn hosted_slots(&self) -> Vec<SlotId> {
        self.slots.read().keys().copied().collect()
    }

    pub async fn status(&self, id: SlotId) -> Option<ReplicaStatus> {
        let replica = self.replica(id)?;
        replica.status().await.ok()
    }

    /// Propose a command through a locally-hosted slot.
    pub async fn propose(&self, id: SlotId, cmd: &SlotCommand, log_id: u64) -> Result<LogIndex> {
        let replica = self
            .replica(id)
            .ok_or(RookeryError::NotLeader { leader: None })?;
        replica.propose(cmd.encode()?, log_id).await
    }

    /// Converge on a committed configuration: host newly-assigned slots,
    /// update changed ones, stop the rest.
    pub async fn apply_cluster_config(&self, state: &ClusterState) -> Result<()> {
        let node_id = self.opts.node_id;
        for slot in &state.slots {
            if slot.replicas.contains(&node_id) {
                self.add_or_update(slot).await?;
            } else if let Some(handle) = {
                let mut slots = self.slots.write();
                slots.remove(&slot.id)
            } {
                info!(slot = slot.id, "slot no longer assigned here, stopping");
                handle.replica.stop().await;
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let handles: Vec<SlotHandle> = self.slots.write().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.replica.stop().await;
        }
    }
}
