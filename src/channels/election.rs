//! Channel leader election.
//!
//! Channel leadership is decided out-of-band from the owning slot's
//! consensus: per-channel propose traffic is far too high to serialize
//! through one slot log. An election job collects the last log position
//! of every channel replica, picks the most up-to-date node, bumps the
//! channel term, and writes the outcome into the channel metadata via
//! the owning slot. One job per fingerprint runs at a time.

use crate::config::Options;
use crate::error::{Result, RookeryError};
use crate::event::ClusterEventServer;
use crate::nodes::NodeManager;
use crate::pool::{PanicPolicy, TaskPool};
use crate::slots::{SlotCommand, SlotManager};
use crate::storage::ShardLogStorage;
use crate::transport::{LastLogInfo, RpcRequest, RpcResponse};
use crate::types::{ChannelMeta, LogIdGenerator, NodeId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::manager::ChannelManager;

/// Everything an election job needs.
pub struct ElectionContext {
    pub opts: Arc<Options>,
    pub node_manager: Arc<NodeManager>,
    pub slot_manager: Arc<SlotManager>,
    pub channel_manager: Arc<ChannelManager>,
    pub event_server: Arc<ClusterEventServer>,
    pub storage: Arc<ShardLogStorage>,
    pub id_gen: Arc<LogIdGenerator>,
}

pub struct ChannelElectionManager {
    ctx: Arc<ElectionContext>,
    pool: Arc<TaskPool>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ChannelElectionManager {
    pub fn new(ctx: Arc<ElectionContext>) -> Self {
        let size = ctx.opts.channel_election_pool_size;
        Self {
            ctx,
            // Elections are must-run work; a panicking election job takes
            // the process down rather than silently losing leadership.
            pool: Arc::new(TaskPool::new("channel-election", size, PanicPolicy::Fatal)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn start(&self) -> Result<()> {
        Ok(())
    }

    pub fn stop(&self) {}

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Run an election for a channel. At most one job per fingerprint is
    /// in flight; a duplicate request is a no-op. Submission blocks when
    /// the election pool is full.
    pub async fn request_election(&self, meta: ChannelMeta) -> Result<()> {
        let fingerprint = meta.key.handler_key();
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(fingerprint.clone()) {
                debug!(channel = %fingerprint, "election already in flight");
                return Ok(());
            }
        }

        let ctx = Arc::clone(&self.ctx);
        let in_flight = Arc::clone(&self.in_flight);
        self.pool
            .spawn(async move {
                if let Err(e) = elect(&ctx, meta).await {
                    warn!(channel = %fingerprint, error = %e, "channel election failed");
                }
                in_flight.lock().remove(&fingerprint);
            })
            .await
    }
}

/// One election round for a channel.
async fn elect(ctx: &ElectionContext, meta: ChannelMeta) -> Result<()> {
    let handler_key = meta.key.handler_key();
    let quorum = meta.replicas.len() / 2 + 1;

    // Collect the last log position of every replica that answers.
    let mut votes: Vec<(NodeId, LastLogInfo)> = Vec::new();
    for replica in &meta.replicas {
        let info = if *replica == ctx.opts.node_id {
            Some(local_last_log_info(ctx, &handler_key).await)
        } else {
            match ctx
                .node_manager
                .call(*replica, RpcRequest::ChannelLastLogInfo(meta.key.clone()))
                .await
            {
                Ok(RpcResponse::ChannelLastLogInfo(info)) => Some(info),
                Ok(other) => {
                    warn!(node = replica, ?other, "unexpected election response");
                    None
                }
                Err(e) => {
                    debug!(node = replica, error = %e, "replica unreachable during election");
                    None
                }
            }
        };
        if let Some(info) = info {
            votes.push((*replica, info));
        }
    }

    if votes.len() < quorum {
        return Err(RookeryError::Internal(format!(
            "election quorum not reached: {} of {}",
            votes.len(),
            quorum
        )));
    }

    // Most up-to-date replica wins; node id breaks exact ties.
    let (winner, _) = votes
        .iter()
        .max_by_key(|(id, info)| (info.last_log_term, info.last_log_index, *id))
        .copied()
        .ok_or_else(|| RookeryError::Internal("election collected no votes".into()))?;
    let max_term = votes
        .iter()
        .map(|(_, info)| info.term)
        .max()
        .unwrap_or(0)
        .max(meta.term);

    let elected = ChannelMeta {
        leader: winner,
        term: max_term + 1,
        ..meta
    };
    info!(
        channel = %handler_key,
        leader = elected.leader,
        term = elected.term,
        "channel leader elected"
    );

    write_channel_meta(ctx, &elected).await?;

    // Install the outcome into the local replica when this node carries
    // the channel.
    if elected.replicas.contains(&ctx.opts.node_id) {
        ctx.channel_manager.register(elected).await?;
    }
    Ok(())
}

async fn local_last_log_info(ctx: &ElectionContext, handler_key: &str) -> LastLogInfo {
    if let Some(replica) = ctx.channel_manager.get(handler_key) {
        if let Ok(status) = replica.status().await {
            return LastLogInfo {
                last_log_index: status.last_log_index,
                last_log_term: status.last_log_term,
                term: status.term,
            };
        }
    }
    storage_last_log_info(&ctx.storage, handler_key)
}

/// Last log position straight from storage, for channels not currently
/// loaded.
pub fn storage_last_log_info(storage: &ShardLogStorage, handler_key: &str) -> LastLogInfo {
    let last_log_index = storage.last_index(handler_key).unwrap_or(0);
    let last_log_term = storage
        .term_at(handler_key, last_log_index)
        .ok()
        .flatten()
        .unwrap_or(0);
    let term = storage
        .term_state(handler_key)
        .ok()
        .flatten()
        .map(|s| s.current_term)
        .unwrap_or(1);
    LastLogInfo {
        last_log_index,
        last_log_term,
        term,
    }
}

/// Persist elected channel metadata through the owning slot's log: a
/// local propose when this node leads the slot, an RPC to the slot
/// leader otherwise.
pub async fn write_channel_meta(ctx: &ElectionContext, meta: &ChannelMeta) -> Result<()> {
    let slot_id = meta.key.owning_slot(ctx.event_server.slot_count());
    let cmd = SlotCommand::SetChannelMeta(meta.clone());

    if let Some(status) = ctx.slot_manager.status(slot_id).await {
        if status.role.is_leader() {
            ctx.slot_manager
                .propose(slot_id, &cmd, ctx.id_gen.next_id())
                .await?;
            return Ok(());
        }
        if status.leader != 0 {
            return propose_meta_remote(ctx, status.leader, meta).await;
        }
    }

    // Slot not hosted here; fall back to the committed assignment.
    let leader = ctx
        .event_server
        .slot(slot_id)
        .map(|s| s.leader)
        .filter(|l| *l != 0)
        .ok_or(RookeryError::NotLeader { leader: None })?;
    propose_meta_remote(ctx, leader, meta).await
}

async fn propose_meta_remote(
    ctx: &ElectionContext,
    leader: NodeId,
    meta: &ChannelMeta,
) -> Result<()> {
    match ctx
        .node_manager
        .call(leader, RpcRequest::ProposeChannelMeta(meta.clone()))
        .await?
    {
        RpcResponse::ProposeChannelMeta(_) => Ok(()),
        RpcResponse::Error(e) => Err(RookeryError::Internal(e)),
        other => {
            warn!(?other, "unexpected propose-meta response");
            Err(RookeryError::Internal("unexpected propose-meta response".into()))
        }
    }
}
