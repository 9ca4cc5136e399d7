//! Cluster-event service: the replicated configuration log.
//!
//! Node membership, slot assignment and api-address updates are entries
//! in a log replicated on the fixed `config` shard across every
//! replica-role node. The applied state is the [`ClusterState`] document,
//! snapshotted to disk after every apply; committed changes fire ready
//! callbacks that drive the node and slot managers to converge.

use crate::config::{parse_seed, Options};
use crate::error::{Result, RookeryError};
use crate::replica::{
    start_replica, LogEntry, ReplicaHandle, ReplicaOptions, ReplicaStatus, ShardMessage,
    ShardSender, ShardStateMachine,
};
use crate::storage::ShardLogStorage;
use crate::types::{
    LogIdGenerator, LogIndex, NodeId, NodeInfo, Role, SlotId, SlotInfo, Term, CONFIG_SHARD_KEY,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// One entry in the configuration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCommand {
    AddNode {
        id: NodeId,
        cluster_addr: String,
        api_addr: String,
        role: Role,
    },
    UpdateApiAddr {
        id: NodeId,
        api_addr: String,
    },
    UpdateSlotLeader {
        slot: SlotId,
        leader: NodeId,
        term: Term,
    },
}

impl ConfigCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// The committed configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Bumped once per applied command.
    pub version: u64,
    pub slot_count: u32,
    pub nodes: Vec<NodeInfo>,
    pub slots: Vec<SlotInfo>,
}

impl ClusterState {
    /// An empty document; used by joining nodes until the cluster's
    /// config log syncs over.
    fn empty(slot_count: u32) -> Self {
        Self {
            version: 0,
            slot_count,
            nodes: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Deterministic bootstrap from the initial member set: every node
    /// computes the identical document, so no consensus round is needed
    /// to agree on it.
    fn bootstrap(opts: &Options) -> Result<Self> {
        let members = opts.bootstrap_nodes()?;
        let mut nodes: Vec<NodeInfo> = members
            .iter()
            .map(|(id, addr)| NodeInfo {
                id: *id,
                cluster_addr: addr.clone(),
                api_addr: if *id == opts.node_id {
                    opts.server_addr.clone()
                } else {
                    String::new()
                },
                role: Role::Replica,
                online: true,
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        let replica_ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        let replica_count = (opts.slot_max_replica_count as usize).min(replica_ids.len());
        let mut slots = Vec::with_capacity(opts.slot_count as usize);
        for slot_id in 0..opts.slot_count {
            let start = slot_id as usize % replica_ids.len();
            let replicas: Vec<NodeId> = (0..replica_count)
                .map(|i| replica_ids[(start + i) % replica_ids.len()])
                .collect();
            slots.push(SlotInfo {
                id: slot_id,
                term: 1,
                replicas: replicas.clone(),
                leader: replicas[0],
            });
        }

        Ok(Self {
            version: 1,
            slot_count: opts.slot_count,
            nodes,
            slots,
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn slot(&self, id: SlotId) -> Option<&SlotInfo> {
        self.slots.iter().find(|s| s.id == id)
    }

    /// Replica-role members, sorted by id. This is the config shard's own
    /// replica set.
    pub fn replica_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.role.is_replica())
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn apply_command(&mut self, cmd: ConfigCommand) {
        match cmd {
            ConfigCommand::AddNode {
                id,
                cluster_addr,
                api_addr,
                role,
            } => {
                if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
                    node.cluster_addr = cluster_addr;
                    if !api_addr.is_empty() {
                        node.api_addr = api_addr;
                    }
                    node.role = role;
                    node.online = true;
                } else {
                    info!(node = id, %cluster_addr, "node joined the configuration");
                    self.nodes.push(NodeInfo {
                        id,
                        cluster_addr,
                        api_addr,
                        role,
                        online: true,
                    });
                    self.nodes.sort_by_key(|n| n.id);
                }
            }
            ConfigCommand::UpdateApiAddr { id, api_addr } => {
                if let Some(node) = self.nodes.iter_mut().find(|n| n.id == id) {
                    node.api_addr = api_addr;
                }
            }
            ConfigCommand::UpdateSlotLeader { slot, leader, term } => {
                if let Some(slot) = self.slots.iter_mut().find(|s| s.id == slot) {
                    if term >= slot.term {
                        slot.leader = leader;
                        slot.term = term;
                    }
                }
            }
        }
        self.version += 1;
    }
}

pub type ReadyCallback = Box<dyn Fn(ClusterState) + Send + Sync>;

/// Applies config entries to the shared document and notifies listeners.
struct ConfigStateMachine {
    state: Arc<RwLock<ClusterState>>,
    snapshot_path: PathBuf,
    ready: Arc<Mutex<Vec<ReadyCallback>>>,
}

impl ShardStateMachine for ConfigStateMachine {
    fn apply(&mut self, entries: &[LogEntry]) -> Result<LogIndex> {
        {
            let mut state = self.state.write();
            for entry in entries {
                match ConfigCommand::decode(entry.data_bytes()) {
                    Ok(cmd) => state.apply_command(cmd),
                    Err(e) => {
                        // A malformed entry is skipped rather than wedging
                        // the config log.
                        error!(index = entry.index, error = %e, "undecodable config entry");
                    }
                }
            }
        }
        let snapshot = self.state.read().clone();
        if let Err(e) = save_snapshot(&self.snapshot_path, &snapshot) {
            error!(error = %e, "config snapshot write failed");
        }
        for cb in self.ready.lock().iter() {
            cb(snapshot.clone());
        }
        Ok(entries.last().map(|e| e.index).unwrap_or(0))
    }
}

fn save_snapshot(path: &PathBuf, state: &ClusterState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(state)?;
    std::fs::write(path, data)?;
    Ok(())
}

fn load_snapshot(path: &PathBuf) -> Result<Option<ClusterState>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The cluster-event service.
pub struct ClusterEventServer {
    opts: Arc<Options>,
    state: Arc<RwLock<ClusterState>>,
    replica: Mutex<Option<Arc<ReplicaHandle>>>,
    is_prepared: AtomicBool,
    ready: Arc<Mutex<Vec<ReadyCallback>>>,
    id_gen: Arc<LogIdGenerator>,
    storage: Arc<ShardLogStorage>,
    snapshot_path: PathBuf,
}

impl ClusterEventServer {
    pub fn new(
        opts: Arc<Options>,
        storage: Arc<ShardLogStorage>,
        id_gen: Arc<LogIdGenerator>,
    ) -> Result<Self> {
        let snapshot_path = opts.config_dir().join("cluster.json");
        let state = match load_snapshot(&snapshot_path)? {
            Some(state) => state,
            None if opts.init_nodes.is_empty() && !opts.seed.trim().is_empty() => {
                // Joining an existing cluster: start empty and let the
                // config log sync over.
                ClusterState::empty(opts.slot_count)
            }
            None => ClusterState::bootstrap(&opts)?,
        };

        let server = Self {
            opts,
            state: Arc::new(RwLock::new(state)),
            replica: Mutex::new(None),
            is_prepared: AtomicBool::new(true),
            ready: Arc::new(Mutex::new(Vec::new())),
            id_gen,
            storage,
            snapshot_path,
        };
        if server.needs_join() {
            server.set_is_prepared(false);
        }
        Ok(server)
    }

    /// Whether this node still has to run the join loop against its seed.
    pub fn needs_join(&self) -> bool {
        if self.opts.seed.trim().is_empty() {
            return false;
        }
        match parse_seed(&self.opts.seed) {
            Ok((seed_id, _)) => self.state.read().node(seed_id).is_none(),
            Err(_) => false,
        }
    }

    /// Start the config shard replica.
    pub async fn start(
        &self,
        sender: Arc<dyn ShardSender>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let replicas = self.state.read().replica_node_ids();
        let handle = start_replica(
            ReplicaOptions {
                node_id: self.opts.node_id,
                shard: CONFIG_SHARD_KEY.to_string(),
                replicas,
                leader_hint: 0,
                sync_limit: self.opts.sync_limit,
                commit_limit: self.opts.commit_limit,
                check_interval: self.opts.check_interval,
                propose_timeout: self.opts.propose_timeout,
                ..Default::default()
            },
            Arc::clone(&self.storage),
            sender,
            Box::new(ConfigStateMachine {
                state: Arc::clone(&self.state),
                snapshot_path: self.snapshot_path.clone(),
                ready: Arc::clone(&self.ready),
            }),
            shutdown,
        )?;
        *self.replica.lock() = Some(Arc::new(handle));
        Ok(())
    }

    pub async fn stop(&self) {
        let replica = self.replica.lock().take();
        if let Some(replica) = replica {
            replica.stop().await;
        }
    }

    fn replica_handle(&self) -> Result<Arc<ReplicaHandle>> {
        self.replica
            .lock()
            .clone()
            .ok_or_else(|| RookeryError::Internal("cluster event server not started".into()))
    }

    /// Feed an inbound config frame into the config replica.
    pub async fn add_message(&self, msg: ShardMessage) -> Result<()> {
        self.replica_handle()?.add_message(msg).await
    }

    /// Propose a configuration change. Fails with `NotLeader` on
    /// followers; callers retry against the leader.
    pub async fn propose(&self, cmd: ConfigCommand) -> Result<LogIndex> {
        let handle = self.replica_handle()?;
        handle.propose(cmd.encode()?, self.id_gen.next_id()).await
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        self.replica_handle()?.status().await
    }

    /// Align the config shard's replica set with the committed document.
    pub async fn sync_replica_set(&self) -> Result<()> {
        let replicas = self.state.read().replica_node_ids();
        self.replica_handle()?.update_config(replicas, 0, 0).await
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.state.read().nodes.clone()
    }

    pub fn node(&self, id: NodeId) -> Option<NodeInfo> {
        self.state.read().node(id).cloned()
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.state.read().slots.clone()
    }

    pub fn slot(&self, id: SlotId) -> Option<SlotInfo> {
        self.state.read().slot(id).cloned()
    }

    pub fn slot_count(&self) -> u32 {
        let count = self.state.read().slot_count;
        if count == 0 {
            self.opts.slot_count
        } else {
            count
        }
    }

    /// Current document, cloned.
    pub fn state_snapshot(&self) -> ClusterState {
        self.state.read().clone()
    }

    /// Adopt a document fetched from the cluster during join. The
    /// deterministic bootstrap of the founding members never enters the
    /// config log, so a joiner seeds its document this way; later log
    /// entries re-apply on top (commands are upserts or term-guarded).
    pub fn install_state(&self, incoming: ClusterState) -> Result<()> {
        {
            let mut state = self.state.write();
            if incoming.version <= state.version {
                return Ok(());
            }
            *state = incoming;
        }
        let snapshot = self.state.read().clone();
        save_snapshot(&self.snapshot_path, &snapshot)?;
        info!(version = snapshot.version, "installed cluster state from seed");
        for cb in self.ready.lock().iter() {
            cb(snapshot.clone());
        }
        Ok(())
    }

    /// Cluster bootstrap/join completed.
    pub fn set_is_prepared(&self, prepared: bool) {
        self.is_prepared.store(prepared, Ordering::SeqCst);
        if prepared {
            info!(node_id = self.opts.node_id, "cluster prepared");
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.is_prepared.load(Ordering::SeqCst)
    }

    /// Register a callback fired after every committed config change.
    pub fn on_ready(&self, cb: ReadyCallback) {
        self.ready.lock().push(cb);
    }

    /// Handle a join request on the receiving side: admit the node into
    /// the configuration and return the known members.
    pub async fn handle_join(&self, id: NodeId, addr: String, role: Role) -> Result<Vec<NodeInfo>> {
        if self.state.read().node(id).is_none() {
            self.propose(ConfigCommand::AddNode {
                id,
                cluster_addr: addr.clone(),
                api_addr: addr,
                role,
            })
            .await?;
        } else {
            warn!(node = id, "join from already-known node");
        }
        Ok(self.nodes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn opts_with_nodes(node_id: NodeId, ids: &[NodeId]) -> Options {
        let init_nodes: HashMap<NodeId, String> = ids
            .iter()
            .map(|id| (*id, format!("n{}:11110", id)))
            .collect();
        Options {
            node_id,
            init_nodes,
            slot_count: 8,
            slot_max_replica_count: 3,
            ..Default::default()
        }
    }

    #[test]
    fn bootstrap_is_deterministic() {
        let a = ClusterState::bootstrap(&opts_with_nodes(1, &[1, 2, 3])).unwrap();
        let b = ClusterState::bootstrap(&opts_with_nodes(2, &[1, 2, 3])).unwrap();
        assert_eq!(a.slots, b.slots);
        assert_eq!(a.replica_node_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn bootstrap_assigns_full_replica_sets() {
        let state = ClusterState::bootstrap(&opts_with_nodes(1, &[1, 2, 3])).unwrap();
        assert_eq!(state.slots.len(), 8);
        for slot in &state.slots {
            assert_eq!(slot.replicas.len(), 3);
            assert_eq!(slot.term, 1);
            assert!(slot.replicas.contains(&slot.leader));
        }
        // Leadership spreads across members.
        let leaders: std::collections::HashSet<NodeId> =
            state.slots.iter().map(|s| s.leader).collect();
        assert!(leaders.len() > 1);
    }

    #[test]
    fn bootstrap_single_node_owns_everything() {
        let opts = Options {
            node_id: 7,
            slot_count: 4,
            ..Default::default()
        };
        let state = ClusterState::bootstrap(&opts).unwrap();
        assert_eq!(state.nodes.len(), 1);
        for slot in &state.slots {
            assert_eq!(slot.replicas, vec![7]);
            assert_eq!(slot.leader, 7);
        }
    }

    #[test]
    fn add_node_command_is_idempotent_on_id() {
        let mut state = ClusterState::bootstrap(&opts_with_nodes(1, &[1, 2])).unwrap();
        let before = state.nodes.len();
        state.apply_command(ConfigCommand::AddNode {
            id: 2,
            cluster_addr: "n2:changed".into(),
            api_addr: "n2:api".into(),
            role: Role::Replica,
        });
        assert_eq!(state.nodes.len(), before);
        assert_eq!(state.node(2).unwrap().cluster_addr, "n2:changed");
    }

    #[test]
    fn slot_leader_update_respects_terms() {
        let mut state = ClusterState::bootstrap(&opts_with_nodes(1, &[1, 2, 3])).unwrap();
        state.apply_command(ConfigCommand::UpdateSlotLeader {
            slot: 0,
            leader: 2,
            term: 5,
        });
        assert_eq!(state.slot(0).unwrap().leader, 2);

        // Stale update is ignored.
        state.apply_command(ConfigCommand::UpdateSlotLeader {
            slot: 0,
            leader: 3,
            term: 2,
        });
        assert_eq!(state.slot(0).unwrap().leader, 2);
    }
}
