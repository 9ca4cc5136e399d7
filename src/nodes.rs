//! Registry of cluster peers.
//!
//! Tracks one [`Peer`] per remote node, started and stopped as the
//! committed configuration changes, and dispatches outbound frames and
//! RPCs by node id.

use crate::error::{Result, RookeryError};
use crate::transport::{
    ClusterJoinReq, ClusterJoinResp, Frame, NetLink, Peer, RpcRequest, RpcResponse,
    TransportOptions,
};
use crate::types::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct NodeManager {
    local_id: NodeId,
    link: Arc<dyn NetLink>,
    opts: TransportOptions,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
}

impl NodeManager {
    pub fn new(local_id: NodeId, link: Arc<dyn NetLink>, opts: TransportOptions) -> Self {
        Self {
            local_id,
            link,
            opts,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer and start its transport worker. Re-adding with a
    /// changed address replaces the worker; the node id is the identity.
    pub async fn add_node(&self, id: NodeId, addr: &str) {
        if id == self.local_id {
            return;
        }
        let stale = {
            let mut peers = self.peers.write();
            if peers.get(&id).map(|p| p.addr() == addr).unwrap_or(false) {
                return;
            }
            let stale = peers.remove(&id);
            let peer =
                Peer::start(id, addr.to_string(), Arc::clone(&self.link), self.opts.clone());
            peers.insert(id, peer);
            stale
        };
        if let Some(stale) = stale {
            info!(node = id, %addr, "peer address changed, restarting transport");
            stale.stop().await;
        } else {
            info!(node = id, %addr, "peer added");
        }
    }

    /// Drain and stop a peer's transport worker.
    pub async fn remove_node(&self, id: NodeId) {
        let peer = self.peers.write().remove(&id);
        if let Some(peer) = peer {
            info!(node = id, "peer removed");
            peer.stop().await;
        }
    }

    /// Peer handle, if registered.
    pub fn node(&self, id: NodeId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers.read().keys().copied().collect()
    }

    /// Send a frame to a peer through its bounded queue.
    pub fn send(&self, to: NodeId, frame: Frame) -> Result<()> {
        let peer = self.node(to).ok_or(RookeryError::PeerUnknown(to))?;
        peer.send(frame)
    }

    /// Request/response RPC against a peer.
    pub async fn call(&self, to: NodeId, req: RpcRequest) -> Result<RpcResponse> {
        let peer = self.node(to).ok_or(RookeryError::PeerUnknown(to))?;
        peer.call(req).await
    }

    /// Ask the seed node to admit this node into the cluster.
    pub async fn request_cluster_join(
        &self,
        seed: NodeId,
        req: ClusterJoinReq,
    ) -> Result<ClusterJoinResp> {
        match self.call(seed, RpcRequest::ClusterJoin(req)).await? {
            RpcResponse::ClusterJoin(resp) => Ok(resp),
            RpcResponse::Error(e) => Err(RookeryError::Internal(e)),
            other => {
                warn!(?other, "unexpected join response");
                Err(RookeryError::Internal("unexpected join response".into()))
            }
        }
    }

    /// Stop every peer worker.
    pub async fn stop(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryMesh;

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let mesh = MemoryMesh::new();
        let manager = NodeManager::new(1, mesh.connector(), TransportOptions::default());
        let err = manager.send(9, Frame::new(2, vec![])).unwrap_err();
        assert!(matches!(err, RookeryError::PeerUnknown(9)));
    }

    #[tokio::test]
    async fn add_remove_node() {
        let mesh = MemoryMesh::new();
        let manager = NodeManager::new(1, mesh.connector(), TransportOptions::default());

        manager.add_node(2, "n2:1").await;
        assert!(manager.node(2).is_some());

        // The local node is never registered as a peer.
        manager.add_node(1, "n1:1").await;
        assert!(manager.node(1).is_none());

        manager.remove_node(2).await;
        assert!(manager.node(2).is_none());
        manager.stop().await;
    }

    #[tokio::test]
    async fn readd_with_same_addr_keeps_worker() {
        let mesh = MemoryMesh::new();
        let manager = NodeManager::new(1, mesh.connector(), TransportOptions::default());

        manager.add_node(2, "n2:1").await;
        let before = manager.node(2).unwrap();
        manager.add_node(2, "n2:1").await;
        let after = manager.node(2).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        manager.stop().await;
    }
}
