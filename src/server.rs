//! The cluster server: composition of the managers, the cluster-event
//! service, the transport, and the inbound demultiplexer.

use crate::channels::{storage_last_log_info, ChannelElectionManager, ChannelManager, ElectionContext};
use crate::config::{parse_seed, Options};
use crate::error::{Result, RookeryError};
use crate::event::{ClusterEventServer, ClusterState};
use crate::hooks::ServerHooks;
use crate::keylock::KeyLock;
use crate::nodes::NodeManager;
use crate::observability::{self, ClusterKind};
use crate::pool::{PanicPolicy, TaskPool};
use crate::replica::{ReplicaHandle, ShardMessage, ShardSender};
use crate::slots::{SlotCommand, SlotManager};
use crate::storage::ShardLogStorage;
use crate::transport::{
    ChannelMetaReq, ClusterJoinReq, ClusterJoinResp, Frame, FrameHandler, JoinNode, LastLogInfo,
    NetLink, NetServer, ReplySender, RpcBody, RpcEnvelope, RpcRequest, RpcResponse,
    TransportOptions, FRAME_CHANNEL, FRAME_CONFIG, FRAME_RPC, FRAME_SLOT,
};
use crate::types::{ChannelKey, ChannelMeta, LogIdGenerator, LogIndex, NodeId, SlotId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const INBOUND_QUEUE_DEPTH: usize = 4096;
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Outbound routing shared by every shard replica.
struct Router {
    node_manager: Arc<NodeManager>,
    stopped: Arc<AtomicBool>,
}

impl Router {
    fn send(&self, kind: ClusterKind, frame_type: u32, msg: ShardMessage) {
        if self.stopped.load(Ordering::Relaxed) {
            return;
        }
        let to = msg.to;
        let size = msg.size();
        let content = match msg.encode() {
            Ok(content) => content,
            Err(e) => {
                error!(error = %e, "outbound message encode failed");
                return;
            }
        };
        observability::record_outgoing(kind, size);
        if let Err(e) = self.node_manager.send(to, Frame::new(frame_type, content)) {
            debug!(to, error = %e, "outbound message dropped");
        }
    }
}

/// Per-kind [`ShardSender`] facade over the router.
struct KindSender {
    router: Arc<Router>,
    kind: ClusterKind,
    frame_type: u32,
}

impl ShardSender for KindSender {
    fn send(&self, msg: ShardMessage) {
        self.router.send(self.kind, self.frame_type, msg);
    }
}

/// Funnel from the external net server into the demux task.
struct InboundHandler {
    tx: mpsc::Sender<(ReplySender, Frame)>,
}

impl FrameHandler for InboundHandler {
    fn on_frame(&self, reply: ReplySender, frame: Frame) {
        if self.tx.try_send((reply, frame)).is_err() {
            warn!("inbound queue full, frame dropped");
        }
    }
}

/// The cluster coordination server.
pub struct ClusterServer {
    opts: Arc<Options>,
    storage: Arc<ShardLogStorage>,
    id_gen: Arc<LogIdGenerator>,
    node_manager: Arc<NodeManager>,
    slot_manager: Arc<SlotManager>,
    channel_manager: Arc<ChannelManager>,
    election_manager: Arc<ChannelElectionManager>,
    event_server: Arc<ClusterEventServer>,
    channel_key_lock: KeyLock,
    net_server: Arc<dyn NetServer>,
    channel_load_pool: Arc<TaskPool>,
    loading: Arc<Mutex<HashSet<String>>>,
    hooks: ServerHooks,
    stopped: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    inbound_tx: mpsc::Sender<(ReplySender, Frame)>,
    inbound_rx: Mutex<Option<mpsc::Receiver<(ReplySender, Frame)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    uptime: Instant,
}

impl ClusterServer {
    /// Build a server from options and the external net collaborators.
    ///
    /// Panics when the options fail validation; a misconfigured node must
    /// not come up half-working.
    pub fn new(
        opts: Options,
        net_server: Arc<dyn NetServer>,
        link: Arc<dyn NetLink>,
        hooks: ServerHooks,
    ) -> Result<Arc<Self>> {
        if let Err(e) = opts.validate() {
            panic!("invalid cluster options: {}", e);
        }
        let opts = Arc::new(opts);

        let storage = Arc::new(ShardLogStorage::open(opts.log_dir())?);
        let id_gen = Arc::new(LogIdGenerator::new(opts.node_id));
        let stopped = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let transport_opts = TransportOptions {
            send_queue_depth: opts.send_queue_depth,
            req_timeout: opts.req_timeout,
            rpc_msg_timeout: opts.peer_rpc_msg_timeout,
            rpc_scan_interval: opts.peer_rpc_timeout_scan_interval,
            ..Default::default()
        };
        let node_manager = Arc::new(NodeManager::new(opts.node_id, link, transport_opts));

        let router = Arc::new(Router {
            node_manager: Arc::clone(&node_manager),
            stopped: Arc::clone(&stopped),
        });
        let slot_sender: Arc<dyn ShardSender> = Arc::new(KindSender {
            router: Arc::clone(&router),
            kind: ClusterKind::Slot,
            frame_type: FRAME_SLOT,
        });
        let channel_sender: Arc<dyn ShardSender> = Arc::new(KindSender {
            router,
            kind: ClusterKind::Channel,
            frame_type: FRAME_CHANNEL,
        });

        let event_server = Arc::new(ClusterEventServer::new(
            Arc::clone(&opts),
            Arc::clone(&storage),
            Arc::clone(&id_gen),
        )?);
        let slot_manager = Arc::new(SlotManager::new(
            Arc::clone(&opts),
            Arc::clone(&storage),
            slot_sender,
            hooks.clone(),
            shutdown_rx.clone(),
        ));
        let channel_manager = Arc::new(ChannelManager::new(
            Arc::clone(&opts),
            Arc::clone(&storage),
            channel_sender,
            hooks.clone(),
            shutdown_rx.clone(),
        ));
        let election_manager = Arc::new(ChannelElectionManager::new(Arc::new(ElectionContext {
            opts: Arc::clone(&opts),
            node_manager: Arc::clone(&node_manager),
            slot_manager: Arc::clone(&slot_manager),
            channel_manager: Arc::clone(&channel_manager),
            event_server: Arc::clone(&event_server),
            storage: Arc::clone(&storage),
            id_gen: Arc::clone(&id_gen),
        })));

        let channel_load_pool = Arc::new(TaskPool::new(
            "channel-load",
            opts.channel_load_pool_size,
            PanicPolicy::Log,
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        // The config sender above keeps the event server decoupled from
        // this struct; the demux below closes the loop.
        let server = Arc::new(Self {
            opts,
            storage,
            id_gen,
            node_manager,
            slot_manager,
            channel_manager,
            election_manager,
            event_server,
            channel_key_lock: KeyLock::new(),
            net_server,
            channel_load_pool,
            loading: Arc::new(Mutex::new(HashSet::new())),
            hooks,
            stopped,
            shutdown_tx,
            shutdown_rx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            tasks: Mutex::new(Vec::new()),
            uptime: Instant::now(),
        });
        Ok(server)
    }

    /// Start every component, in dependency order. Each step must succeed
    /// before the next runs.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Storage opened during construction; verify it is writable.
        self.storage.flush()?;

        self.channel_key_lock.start_clean_loop();

        // Seed the node manager from the committed configuration, falling
        // back to the bootstrap member list.
        let nodes = self.event_server.nodes();
        if !nodes.is_empty() {
            for node in &nodes {
                self.node_manager.add_node(node.id, &node.cluster_addr).await;
            }
        } else {
            for (id, addr) in self.opts.bootstrap_nodes()? {
                self.node_manager.add_node(id, &addr).await;
            }
        }

        // Host every locally-assigned slot.
        for slot in self.event_server.slots() {
            if slot.replicas.contains(&self.opts.node_id) {
                self.slot_manager.add_or_update(&slot).await?;
            }
        }

        self.election_manager.start()?;

        self.event_server
            .start(self.config_sender(), self.shutdown_rx.clone())
            .await?;
        self.install_ready_callback();

        // Routes + net server.
        let demux_rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| RookeryError::Internal("server already started".into()))?;
        let demux = tokio::spawn(demux_loop(
            Arc::clone(self),
            demux_rx,
            self.shutdown_rx.clone(),
        ));
        self.tasks.lock().push(demux);
        self.net_server
            .start(Arc::new(InboundHandler {
                tx: self.inbound_tx.clone(),
            }))
            .await?;

        self.slot_manager.start()?;
        self.channel_manager.start()?;

        if self.event_server.needs_join() {
            self.event_server.set_is_prepared(false);
            let join = tokio::spawn(join_loop(Arc::clone(self), self.shutdown_rx.clone()));
            self.tasks.lock().push(join);
        }

        info!(node_id = self.opts.node_id, "cluster server started");
        Ok(())
    }

    /// Stop everything in reverse order of start.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.node_manager.stop().await;
        self.election_manager.stop();
        self.net_server.stop().await;
        self.event_server.stop().await;
        self.slot_manager.stop().await;
        self.channel_manager.stop().await;
        self.channel_key_lock.stop_clean_loop();
        if let Err(e) = self.storage.flush() {
            error!(error = %e, "final storage flush failed");
        }
        info!(node_id = self.opts.node_id, "cluster server stopped");
    }

    fn config_sender(&self) -> Arc<dyn ShardSender> {
        Arc::new(KindSender {
            router: Arc::new(Router {
                node_manager: Arc::clone(&self.node_manager),
                stopped: Arc::clone(&self.stopped),
            }),
            kind: ClusterKind::Config,
            frame_type: FRAME_CONFIG,
        })
    }

    /// Committed configuration changes drive the managers to converge.
    fn install_ready_callback(self: &Arc<Self>) {
        let server = Arc::downgrade(self);
        self.event_server.on_ready(Box::new(move |state| {
            if let Some(server) = server.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = server.converge(state).await {
                        error!(error = %e, "configuration convergence failed");
                    }
                });
            }
        }));
    }

    async fn converge(self: &Arc<Self>, state: ClusterState) -> Result<()> {
        for node in &state.nodes {
            self.node_manager.add_node(node.id, &node.cluster_addr).await;
        }
        if !state.nodes.is_empty() {
            for peer in self.node_manager.node_ids() {
                if state.node(peer).is_none() {
                    self.node_manager.remove_node(peer).await;
                }
            }
        }
        self.slot_manager.apply_cluster_config(&state).await?;
        self.event_server.sync_replica_set().await?;
        Ok(())
    }

    // ---- public surface ----

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn node_id(&self) -> NodeId {
        self.opts.node_id
    }

    pub fn event_server(&self) -> &Arc<ClusterEventServer> {
        &self.event_server
    }

    pub fn is_prepared(&self) -> bool {
        self.event_server.is_prepared()
    }

    /// Time since the server came up.
    pub fn uptime(&self) -> Duration {
        self.uptime.elapsed()
    }

    /// The slot owning a channel or routing key.
    pub fn slot_for(&self, key: &str) -> SlotId {
        crate::types::slot_for_key(key, self.event_server.slot_count())
    }

    /// Propose an application payload through a locally-hosted slot.
    pub async fn propose_to_slot(&self, slot: SlotId, data: Vec<u8>) -> Result<LogIndex> {
        self.slot_manager
            .propose(slot, &SlotCommand::App(data), self.id_gen.next_id())
            .await
    }

    /// Propose a payload to a loaded channel (leader only).
    pub async fn propose_to_channel(&self, key: &ChannelKey, data: Vec<u8>) -> Result<LogIndex> {
        let handler_key = key.handler_key();
        let replica = self
            .channel_manager
            .get(&handler_key)
            .ok_or_else(|| RookeryError::ChannelNotFound(handler_key.clone()))?;
        replica.propose(data, self.id_gen.next_id()).await
    }

    /// Feed an inbound config message (used by embedders with their own
    /// framing).
    pub async fn add_config_message(&self, msg: ShardMessage) -> Result<()> {
        self.event_server.add_message(msg).await
    }

    /// Feed an inbound slot message.
    pub async fn add_slot_message(&self, msg: ShardMessage) -> Result<()> {
        observability::record_incoming(ClusterKind::Slot, msg.size());
        self.slot_manager.add_message(msg).await
    }

    /// Feed an inbound channel message, loading the channel on demand.
    pub async fn add_channel_message(self: &Arc<Self>, msg: ShardMessage) -> Result<()> {
        observability::record_incoming(ClusterKind::Channel, msg.size());

        if self.channel_manager.get(&msg.handler_key).is_some() {
            return self.channel_manager.add_message(msg).await;
        }

        // First frame for an unloaded channel: kick off a load, exactly
        // once. The frame itself is dropped; replication catches the
        // channel up once it is registered.
        {
            let mut loading = self.loading.lock();
            if !loading.insert(msg.handler_key.clone()) {
                debug!(key = %msg.handler_key, "channel load already in flight");
                return Ok(());
            }
        }

        let running = self.channel_load_pool.running();
        let size = self.channel_load_pool.size();
        if running + 10 > size {
            warn!(running, size, "channel load pool is busy");
        }

        let Some(key) = ChannelKey::from_handler_key(&msg.handler_key) else {
            self.loading.lock().remove(&msg.handler_key);
            warn!(key = %msg.handler_key, "malformed channel key, message dropped");
            return Ok(());
        };

        let server = Arc::clone(self);
        let handler_key = msg.handler_key.clone();
        let from = msg.from;
        let submitted = self.channel_load_pool.try_spawn(async move {
            if let Err(e) = server.load_or_create_channel(key.clone()).await {
                error!(key = %handler_key, from, error = %e, "channel load failed");
            } else {
                debug!(key = %handler_key, from, "channel activated");
            }
            server.loading.lock().remove(&handler_key);
        });
        if let Err(e) = submitted {
            self.loading.lock().remove(&msg.handler_key);
            error!(key = %msg.handler_key, error = %e, "channel load submit failed");
            return Err(e);
        }
        Ok(())
    }

    /// Resolve a channel's metadata (creating it on first use) and
    /// register its replica.
    pub async fn load_or_create_channel(
        self: &Arc<Self>,
        key: ChannelKey,
    ) -> Result<Arc<ReplicaHandle>> {
        let handler_key = key.handler_key();
        let _guard = self.channel_key_lock.lock(&handler_key).await;

        if let Some(existing) = self.channel_manager.get(&handler_key) {
            return Ok(existing);
        }

        let slot_id = key.owning_slot(self.event_server.slot_count());
        let meta = self.resolve_channel_meta(&key, slot_id, true).await?;

        let needs_election = meta.leader == 0;
        let replica = self.channel_manager.register(meta.clone()).await?;
        if needs_election {
            self.election_manager.request_election(meta).await?;
        }
        Ok(replica)
    }

    /// Channel metadata from the owning slot: local store when the slot
    /// is hosted here, the slot leader over RPC otherwise.
    async fn resolve_channel_meta(
        self: &Arc<Self>,
        key: &ChannelKey,
        slot_id: SlotId,
        create_if_none: bool,
    ) -> Result<ChannelMeta> {
        if self.slot_manager.replica(slot_id).is_some() {
            if let Some(meta) = self.storage.channel_meta(slot_id, &key.handler_key())? {
                return Ok(meta);
            }
            let status = self.slot_manager.status(slot_id).await;
            let is_leader = status.as_ref().map(|s| s.role.is_leader()).unwrap_or(false);
            if is_leader {
                if !create_if_none {
                    return Err(RookeryError::ChannelNotFound(key.handler_key()));
                }
                return self.create_channel_meta(key, slot_id).await;
            }
            let leader = status.map(|s| s.leader).unwrap_or(0);
            if leader != 0 {
                return self.fetch_channel_meta(leader, key, create_if_none).await;
            }
            return Err(RookeryError::NotLeader { leader: None });
        }

        let leader = self
            .event_server
            .slot(slot_id)
            .map(|s| s.leader)
            .filter(|l| *l != 0)
            .ok_or(RookeryError::NotLeader { leader: None })?;
        self.fetch_channel_meta(leader, key, create_if_none).await
    }

    /// Initialize a fresh metadata record and commit it through the slot
    /// this node leads.
    async fn create_channel_meta(
        self: &Arc<Self>,
        key: &ChannelKey,
        slot_id: SlotId,
    ) -> Result<ChannelMeta> {
        let slot = self
            .event_server
            .slot(slot_id)
            .ok_or_else(|| RookeryError::Internal(format!("slot {} not in config", slot_id)))?;
        let replica_count = (self.opts.channel_max_replica_count as usize).min(slot.replicas.len());
        let meta = ChannelMeta {
            key: key.clone(),
            replicas: slot.replicas[..replica_count].to_vec(),
            leader: 0,
            term: 0,
        };
        self.slot_manager
            .propose(
                slot_id,
                &SlotCommand::SetChannelMeta(meta.clone()),
                self.id_gen.next_id(),
            )
            .await?;
        Ok(meta)
    }

    async fn fetch_channel_meta(
        &self,
        leader: NodeId,
        key: &ChannelKey,
        create_if_none: bool,
    ) -> Result<ChannelMeta> {
        let resp = self
            .node_manager
            .call(
                leader,
                RpcRequest::ChannelMeta(ChannelMetaReq {
                    key: key.clone(),
                    create_if_none,
                }),
            )
            .await?;
        match resp {
            RpcResponse::ChannelMeta(Some(meta)) => Ok(meta),
            RpcResponse::ChannelMeta(None) => {
                Err(RookeryError::ChannelNotFound(key.handler_key()))
            }
            RpcResponse::Error(e) => Err(RookeryError::Internal(e)),
            other => {
                warn!(?other, "unexpected channel meta response");
                Err(RookeryError::Internal("unexpected channel meta response".into()))
            }
        }
    }

    // ---- rpc handling ----

    async fn handle_rpc(self: Arc<Self>, reply: ReplySender, id: u64, req: RpcRequest) {
        let resp = match req {
            RpcRequest::ClusterJoin(req) => self.handle_join_rpc(req).await,
            RpcRequest::ChannelMeta(req) => match self
                .resolve_channel_meta(
                    &req.key,
                    req.key.owning_slot(self.event_server.slot_count()),
                    req.create_if_none,
                )
                .await
            {
                Ok(meta) => RpcResponse::ChannelMeta(Some(meta)),
                Err(RookeryError::ChannelNotFound(_)) => RpcResponse::ChannelMeta(None),
                Err(e) => RpcResponse::Error(e.to_string()),
            },
            RpcRequest::ProposeChannelMeta(meta) => {
                let slot_id = meta.key.owning_slot(self.event_server.slot_count());
                match self
                    .slot_manager
                    .propose(
                        slot_id,
                        &SlotCommand::SetChannelMeta(meta.clone()),
                        self.id_gen.next_id(),
                    )
                    .await
                {
                    Ok(_) => RpcResponse::ProposeChannelMeta(meta),
                    Err(e) => RpcResponse::Error(e.to_string()),
                }
            }
            RpcRequest::ChannelLastLogInfo(key) => {
                RpcResponse::ChannelLastLogInfo(self.local_channel_log_info(&key).await)
            }
            RpcRequest::ClusterStateQuery => {
                RpcResponse::ClusterState(self.event_server.state_snapshot())
            }
        };

        let envelope = RpcEnvelope {
            id,
            body: RpcBody::Response(resp),
        };
        match envelope.encode() {
            Ok(content) => reply.send(Frame::new(FRAME_RPC, content)),
            Err(e) => error!(error = %e, "rpc response encode failed"),
        }
    }

    async fn handle_join_rpc(&self, req: ClusterJoinReq) -> RpcResponse {
        info!(node = req.node_id, addr = %req.server_addr, "join request");
        // Make the joiner reachable right away; the config change follows.
        self.node_manager
            .add_node(req.node_id, &req.server_addr)
            .await;
        match self
            .event_server
            .handle_join(req.node_id, req.server_addr.clone(), req.role)
            .await
        {
            Ok(nodes) => RpcResponse::ClusterJoin(ClusterJoinResp {
                nodes: nodes
                    .into_iter()
                    .map(|n| JoinNode {
                        node_id: n.id,
                        server_addr: n.cluster_addr,
                    })
                    .collect(),
            }),
            Err(RookeryError::NotLeader { leader: Some(leader) }) => {
                // The seed is not the config leader; hand the join over.
                match self
                    .node_manager
                    .call(leader, RpcRequest::ClusterJoin(req))
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => RpcResponse::Error(e.to_string()),
                }
            }
            Err(e) => RpcResponse::Error(e.to_string()),
        }
    }

    async fn local_channel_log_info(&self, key: &ChannelKey) -> LastLogInfo {
        let handler_key = key.handler_key();
        if let Some(replica) = self.channel_manager.get(&handler_key) {
            if let Ok(status) = replica.status().await {
                return LastLogInfo {
                    last_log_index: status.last_log_index,
                    last_log_term: status.last_log_term,
                    term: status.term,
                };
            }
        }
        storage_last_log_info(&self.storage, &handler_key)
    }
}

/// Inbound frame demultiplexer, one task per server.
async fn demux_loop(
    server: Arc<ClusterServer>,
    mut rx: mpsc::Receiver<(ReplySender, Frame)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (reply, frame) = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
            _ = shutdown.changed() => return,
        };
        if server.stopped.load(Ordering::Relaxed) {
            return;
        }

        let size = frame.size();
        match frame.msg_type {
            FRAME_CONFIG => {
                observability::record_incoming(ClusterKind::Config, size);
                match ShardMessage::decode(&frame.content) {
                    Ok(msg) => {
                        if let Err(e) = server.add_config_message(msg).await {
                            debug!(error = %e, "config message not accepted");
                        }
                    }
                    Err(e) => error!(error = %e, "undecodable config frame"),
                }
            }
            FRAME_SLOT => match ShardMessage::decode(&frame.content) {
                Ok(msg) => {
                    if let Err(e) = server.add_slot_message(msg).await {
                        debug!(error = %e, "slot message not accepted");
                    }
                }
                Err(e) => error!(error = %e, "undecodable slot frame"),
            },
            FRAME_CHANNEL => match ShardMessage::decode(&frame.content) {
                Ok(msg) => {
                    if let Err(e) = server.add_channel_message(msg).await {
                        debug!(error = %e, "channel message not accepted");
                    }
                }
                Err(e) => error!(error = %e, "undecodable channel frame"),
            },
            FRAME_RPC => match RpcEnvelope::decode(&frame.content) {
                Ok(RpcEnvelope {
                    id,
                    body: RpcBody::Request(req),
                }) => {
                    tokio::spawn(Arc::clone(&server).handle_rpc(reply, id, req));
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "undecodable rpc frame"),
            },
            other => {
                observability::record_incoming(ClusterKind::Unknown, size);
                if let Some(on_message) = server.hooks.on_message.clone() {
                    // Unknown frames run through the bounded load pool so a
                    // flood cannot spawn unbounded tasks.
                    let submitted = server
                        .channel_load_pool
                        .try_spawn(async move { on_message(frame) });
                    if submitted.is_err() {
                        warn!(msg_type = other, "user message dropped, pool saturated");
                    }
                } else {
                    debug!(msg_type = other, "unroutable frame dropped");
                }
            }
        }
    }
}

/// Retry joining through the seed until it succeeds or the server stops.
async fn join_loop(server: Arc<ClusterServer>, mut shutdown: watch::Receiver<bool>) {
    let Ok((seed_id, _)) = parse_seed(&server.opts.seed) else {
        return;
    };
    let req = ClusterJoinReq {
        node_id: server.opts.node_id,
        server_addr: server.opts.addr.replace("tcp://", ""),
        role: server.opts.role,
    };
    loop {
        tokio::select! {
            _ = tokio::time::sleep(JOIN_RETRY_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }
        match server
            .node_manager
            .request_cluster_join(seed_id, req.clone())
            .await
        {
            Ok(resp) => {
                for node in resp.nodes {
                    if node.node_id != server.opts.node_id {
                        server
                            .node_manager
                            .add_node(node.node_id, &node.server_addr)
                            .await;
                    }
                }
                // Seed the local document; the founding members' bootstrap
                // never went through the config log.
                match server
                    .node_manager
                    .call(seed_id, RpcRequest::ClusterStateQuery)
                    .await
                {
                    Ok(RpcResponse::ClusterState(state)) => {
                        if let Err(e) = server.event_server.install_state(state) {
                            error!(error = %e, "installing cluster state failed");
                            continue;
                        }
                    }
                    Ok(other) => {
                        warn!(?other, "unexpected cluster state response");
                        continue;
                    }
                    Err(e) => {
                        error!(seed = seed_id, error = %e, "cluster state query failed");
                        continue;
                    }
                }
                server.event_server.set_is_prepared(true);
                info!(node_id = server.opts.node_id, "joined cluster via seed");
                return;
            }
            Err(e) => {
                error!(seed = seed_id, error = %e, "cluster join attempt failed");
            }
        }
    }
}
