//! Intra-cluster transport.
//!
//! Framing is external: a [`NetLink`] dials peers and a [`NetServer`]
//! accepts connections, both supplied by the embedding process (tests use
//! the in-memory [`memory`] mesh). The transport proper maintains one
//! outbound connection per peer behind a bounded send queue, reconnects
//! transparently, and multiplexes request/response RPCs with timeout
//! reaping.

pub mod memory;

use crate::error::{Result, RookeryError};
use crate::observability;
use crate::types::{ChannelKey, ChannelMeta, LogIndex, NodeId, Role, Term};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Frame kind: cluster configuration traffic.
pub const FRAME_CONFIG: u32 = 1;
/// Frame kind: slot replication traffic.
pub const FRAME_SLOT: u32 = 2;
/// Frame kind: channel replication traffic.
pub const FRAME_CHANNEL: u32 = 3;
/// Frame kind: request/response RPC envelope.
pub const FRAME_RPC: u32 = 4;

/// Every intra-cluster message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub msg_type: u32,
    pub content: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u32, content: Vec<u8>) -> Self {
        Self { msg_type, content }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64 + 4
    }
}

/// Join request sent to the seed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJoinReq {
    pub node_id: NodeId,
    pub server_addr: String,
    pub role: Role,
}

/// Node entry returned from a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinNode {
    pub node_id: NodeId,
    pub server_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJoinResp {
    pub nodes: Vec<JoinNode>,
}

/// Channel metadata lookup against the owning slot's leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMetaReq {
    pub key: ChannelKey,
    pub create_if_none: bool,
}

/// Last log position of a channel replica, gathered during elections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastLogInfo {
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub term: Term,
}

/// Request half of the internal RPC surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    ClusterJoin(ClusterJoinReq),
    ClusterStateQuery,
    ChannelMeta(ChannelMetaReq),
    ProposeChannelMeta(ChannelMeta),
    ChannelLastLogInfo(ChannelKey),
}

/// Response half of the internal RPC surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    ClusterJoin(ClusterJoinResp),
    ClusterState(crate::event::ClusterState),
    ChannelMeta(Option<ChannelMeta>),
    ProposeChannelMeta(ChannelMeta),
    ChannelLastLogInfo(LastLogInfo),
    Error(String),
}

/// Correlated RPC envelope carried in `FRAME_RPC` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub id: u64,
    pub body: RpcBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcBody {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl RpcEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Outbound connector, provided by the embedding process.
#[async_trait]
pub trait NetLink: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> Result<Box<dyn FrameConn>>;
}

/// One established framed connection.
#[async_trait]
pub trait FrameConn: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn recv(&mut self) -> Result<Frame>;
}

/// Inbound listener, provided by the embedding process.
#[async_trait]
pub trait NetServer: Send + Sync + 'static {
    async fn start(&self, handler: Arc<dyn FrameHandler>) -> Result<()>;
    async fn stop(&self);
}

/// Receiver of inbound frames; `reply` writes back on the same connection.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, reply: ReplySender, frame: Frame);
}

/// Best-effort response sink tied to one inbound connection.
#[derive(Clone)]
pub struct ReplySender {
    tx: mpsc::Sender<Frame>,
}

impl ReplySender {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: Frame) {
        if let Err(e) = self.tx.try_send(frame) {
            debug!(error = %e, "reply dropped, connection backlogged or gone");
        }
    }
}

/// Transport tuning, derived from the server options.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub send_queue_depth: usize,
    pub req_timeout: Duration,
    pub rpc_msg_timeout: Duration,
    pub rpc_scan_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            send_queue_depth: 1024,
            req_timeout: Duration::from_secs(10),
            rpc_msg_timeout: Duration::from_secs(10),
            rpc_scan_interval: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(200),
        }
    }
}

struct PendingRpc {
    created: Instant,
    reply: oneshot::Sender<Result<RpcResponse>>,
}

/// A remote cluster member with a live outbound connection worker.
pub struct Peer {
    id: NodeId,
    addr: String,
    queue_tx: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<u64, PendingRpc>>>,
    next_rpc_id: AtomicU64,
    req_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Start the connection worker and RPC reaper for a peer.
    pub fn start(
        id: NodeId,
        addr: String,
        link: Arc<dyn NetLink>,
        opts: TransportOptions,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(opts.send_queue_depth);
        let (stop_tx, stop_rx) = watch::channel(false);
        let pending = Arc::new(Mutex::new(HashMap::new()));

        let peer = Arc::new(Self {
            id,
            addr: addr.clone(),
            queue_tx,
            pending: Arc::clone(&pending),
            next_rpc_id: AtomicU64::new(1),
            req_timeout: opts.req_timeout,
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let worker = tokio::spawn(connection_worker(
            id,
            addr,
            link,
            queue_rx,
            Arc::clone(&pending),
            stop_rx.clone(),
            opts.reconnect_backoff,
        ));
        let reaper = tokio::spawn(rpc_reaper(
            id,
            pending,
            stop_rx,
            opts.rpc_msg_timeout,
            opts.rpc_scan_interval,
        ));
        peer.tasks.lock().extend([worker, reaper]);
        peer
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Fire-and-forget send through the bounded per-peer queue.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.queue_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                observability::record_transport_drop(self.id);
                RookeryError::Overflow(self.id)
            }
            mpsc::error::TrySendError::Closed(_) => RookeryError::Canceled,
        })
    }

    /// Request/response RPC with the configured timeout.
    pub async fn call(&self, req: RpcRequest) -> Result<RpcResponse> {
        let id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRpc {
                created: Instant::now(),
                reply,
            },
        );

        let envelope = RpcEnvelope {
            id,
            body: RpcBody::Request(req),
        };
        let frame = Frame::new(FRAME_RPC, envelope.encode()?);
        if self.queue_tx.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(RookeryError::Canceled);
        }

        match tokio::time::timeout(self.req_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RookeryError::Canceled),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RookeryError::Timeout(self.req_timeout.as_millis() as u64))
            }
        }
    }

    /// Stop the worker, failing every in-flight RPC.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let drained: Vec<PendingRpc> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in drained {
            let _ = p.reply.send(Err(RookeryError::Canceled));
        }
    }
}

async fn connection_worker(
    id: NodeId,
    addr: String,
    link: Arc<dyn NetLink>,
    mut queue_rx: mpsc::Receiver<Frame>,
    pending: Arc<Mutex<HashMap<u64, PendingRpc>>>,
    mut stop_rx: watch::Receiver<bool>,
    backoff: Duration,
) {
    loop {
        if *stop_rx.borrow() {
            return;
        }

        let mut conn = tokio::select! {
            conn = link.connect(&addr) => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(peer = id, %addr, error = %e, "connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = stop_rx.changed() => return,
                    }
                }
            },
            _ = stop_rx.changed() => return,
        };
        debug!(peer = id, %addr, "connected");

        loop {
            tokio::select! {
                frame = queue_rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = conn.send(frame).await {
                            warn!(peer = id, error = %e, "send failed, reconnecting");
                            break;
                        }
                    }
                    None => return,
                },
                inbound = conn.recv() => match inbound {
                    Ok(frame) => dispatch_response(&pending, frame),
                    Err(_) => {
                        debug!(peer = id, "connection closed, reconnecting");
                        break;
                    }
                },
                _ = stop_rx.changed() => return,
            }
        }
    }
}

/// Complete a pending call from an RPC response riding the outbound
/// connection.
fn dispatch_response(pending: &Mutex<HashMap<u64, PendingRpc>>, frame: Frame) {
    if frame.msg_type != FRAME_RPC {
        return;
    }
    let envelope = match RpcEnvelope::decode(&frame.content) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "undecodable rpc response");
            return;
        }
    };
    if let RpcBody::Response(resp) = envelope.body {
        if let Some(p) = pending.lock().remove(&envelope.id) {
            let _ = p.reply.send(Ok(resp));
        }
    }
}

async fn rpc_reaper(
    id: NodeId,
    pending: Arc<Mutex<HashMap<u64, PendingRpc>>>,
    mut stop_rx: watch::Receiver<bool>,
    msg_timeout: Duration,
    scan_interval: Duration,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => return,
        }
        let now = Instant::now();
        let expired: Vec<PendingRpc> = {
            let mut pending = pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.created) >= msg_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        if !expired.is_empty() {
            debug!(peer = id, count = expired.len(), "reaped timed-out rpcs");
        }
        for p in expired {
            let _ = p
                .reply
                .send(Err(RookeryError::Timeout(msg_timeout.as_millis() as u64)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryMesh;
    use super::*;

    struct EchoHandler;

    impl FrameHandler for EchoHandler {
        fn on_frame(&self, reply: ReplySender, frame: Frame) {
            if frame.msg_type != FRAME_RPC {
                return;
            }
            let envelope = RpcEnvelope::decode(&frame.content).unwrap();
            if let RpcBody::Request(RpcRequest::ClusterJoin(req)) = envelope.body {
                let resp = RpcEnvelope {
                    id: envelope.id,
                    body: RpcBody::Response(RpcResponse::ClusterJoin(ClusterJoinResp {
                        nodes: vec![JoinNode {
                            node_id: req.node_id,
                            server_addr: req.server_addr,
                        }],
                    })),
                };
                reply.send(Frame::new(FRAME_RPC, resp.encode().unwrap()));
            }
        }
    }

    #[tokio::test]
    async fn rpc_round_trip() {
        let mesh = MemoryMesh::new();
        let server = mesh.server("n1:1");
        server.start(Arc::new(EchoHandler)).await.unwrap();

        let peer = Peer::start(
            1,
            "n1:1".to_string(),
            mesh.connector(),
            TransportOptions::default(),
        );
        let resp = peer
            .call(RpcRequest::ClusterJoin(ClusterJoinReq {
                node_id: 4,
                server_addr: "h4:5001".into(),
                role: Role::Replica,
            }))
            .await
            .unwrap();
        match resp {
            RpcResponse::ClusterJoin(resp) => {
                assert_eq!(resp.nodes.len(), 1);
                assert_eq!(resp.nodes[0].node_id, 4);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        peer.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn call_times_out_when_peer_down() {
        let mesh = MemoryMesh::new();
        let peer = Peer::start(
            1,
            "nowhere:1".to_string(),
            mesh.connector(),
            TransportOptions {
                req_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );
        let err = peer
            .call(RpcRequest::ChannelLastLogInfo(ChannelKey::new("c", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RookeryError::Timeout(_)));
        peer.stop().await;
    }

    #[tokio::test]
    async fn overflow_when_queue_full() {
        let mesh = MemoryMesh::new();
        // No listener: frames pile up in the queue.
        let peer = Peer::start(
            9,
            "void:1".to_string(),
            mesh.connector(),
            TransportOptions {
                send_queue_depth: 2,
                ..Default::default()
            },
        );
        peer.send(Frame::new(FRAME_SLOT, vec![1])).unwrap();
        peer.send(Frame::new(FRAME_SLOT, vec![2])).unwrap();
        let err = peer.send(Frame::new(FRAME_SLOT, vec![3])).unwrap_err();
        assert!(matches!(err, RookeryError::Overflow(9)));
        peer.stop().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_restart() {
        let mesh = MemoryMesh::new();
        let peer = Peer::start(
            1,
            "late:1".to_string(),
            mesh.connector(),
            TransportOptions {
                reconnect_backoff: Duration::from_millis(20),
                ..Default::default()
            },
        );

        // Server comes up after the peer already started dialing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let server = mesh.server("late:1");
        server.start(Arc::new(EchoHandler)).await.unwrap();

        let resp = peer
            .call(RpcRequest::ClusterJoin(ClusterJoinReq {
                node_id: 2,
                server_addr: "h2:5001".into(),
                role: Role::Replica,
            }))
            .await
            .unwrap();
        assert!(matches!(resp, RpcResponse::ClusterJoin(_)));
        peer.stop().await;
        server.stop().await;
    }
}
