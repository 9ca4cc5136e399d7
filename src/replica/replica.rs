//! Per-shard replication state machine.
//!
//! Each shard (a slot, a channel, or the config log) is driven by one
//! logical task. Inbound messages, local proposes and configuration
//! updates are serialized through the replica's inbox, so the state
//! machine itself is free of locks. Outbound messages leave through the
//! injected [`ShardSender`]; committed entries reach the owner through a
//! [`ShardStateMachine`].

use crate::error::{Result, RookeryError};
use crate::storage::ShardLogStorage;
use crate::types::{LogIndex, NodeId, Term};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::log::ShardLog;
use super::message::{LogEntry, MessageType, ShardMessage, SyncInfo};
use super::state::{ReplicaRole, ReplicaState};

/// Bytes of entry payload read from storage per sync fill.
const SYNC_READ_MAX_BYTES: u64 = 1024 * 1024;

/// Consumer of committed entries. Called only from the replica's own
/// task; implementations need no internal locking.
pub trait ShardStateMachine: Send + 'static {
    /// Apply committed entries; returns the new applied index.
    fn apply(&mut self, entries: &[LogEntry]) -> Result<LogIndex>;

    /// Observe the commit index advancing.
    fn on_commit(&mut self, _old: LogIndex, _new: LogIndex) {}
}

/// Outbound hook for replica messages. The cluster server routes them to
/// the destination node's transport.
pub trait ShardSender: Send + Sync + 'static {
    fn send(&self, msg: ShardMessage);
}

impl<F> ShardSender for F
where
    F: Fn(ShardMessage) + Send + Sync + 'static,
{
    fn send(&self, msg: ShardMessage) {
        self(msg)
    }
}

/// Tuning for one replica.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub node_id: NodeId,
    pub shard: String,
    pub replicas: Vec<NodeId>,
    /// Last known leader, 0 when unknown.
    pub leader_hint: NodeId,
    pub sync_limit: u32,
    pub commit_limit: u32,
    pub check_interval: Duration,
    pub propose_timeout: Duration,
    pub inbox_depth: usize,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            node_id: 0,
            shard: String::new(),
            replicas: Vec::new(),
            leader_hint: 0,
            sync_limit: 20,
            commit_limit: 20,
            check_interval: Duration::from_millis(250),
            propose_timeout: Duration::from_secs(5),
            inbox_depth: 256,
        }
    }
}

/// Point-in-time view of a replica, for elections and introspection.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub role: ReplicaRole,
    pub leader: NodeId,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub committed_index: LogIndex,
    pub applied_index: LogIndex,
}

/// Events consumed by the replica task.
pub enum ReplicaEvent {
    Message(ShardMessage),
    Propose {
        data: Vec<u8>,
        log_id: u64,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    ConfigUpdate {
        replicas: Vec<NodeId>,
        leader: NodeId,
        term: Term,
    },
    Status {
        reply: oneshot::Sender<ReplicaStatus>,
    },
    Stop,
}

/// Handle owned by a manager; the replica task runs until stopped.
pub struct ReplicaHandle {
    shard: String,
    tx: mpsc::Sender<ReplicaEvent>,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaHandle {
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Enqueue an inbound replication message.
    pub async fn add_message(&self, msg: ShardMessage) -> Result<()> {
        self.tx
            .send(ReplicaEvent::Message(msg))
            .await
            .map_err(|_| RookeryError::Canceled)
    }

    /// Propose a payload; resolves once the entry is accepted and
    /// committed, or fails with `NotLeader`/`ProposeTimeout`.
    pub async fn propose(&self, data: Vec<u8>, log_id: u64) -> Result<LogIndex> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReplicaEvent::Propose { data, log_id, reply })
            .await
            .map_err(|_| RookeryError::Canceled)?;
        rx.await.map_err(|_| RookeryError::Canceled)?
    }

    pub async fn update_config(
        &self,
        replicas: Vec<NodeId>,
        leader: NodeId,
        term: Term,
    ) -> Result<()> {
        self.tx
            .send(ReplicaEvent::ConfigUpdate {
                replicas,
                leader,
                term,
            })
            .await
            .map_err(|_| RookeryError::Canceled)
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ReplicaEvent::Status { reply })
            .await
            .map_err(|_| RookeryError::Canceled)?;
        rx.await.map_err(|_| RookeryError::Canceled)
    }

    /// Ask the task to stop and wait for it to wind down.
    pub async fn stop(&self) {
        let _ = self.tx.send(ReplicaEvent::Stop).await;
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// Spawn a replica task for one shard, restoring persisted state.
pub fn start_replica(
    opts: ReplicaOptions,
    storage: Arc<ShardLogStorage>,
    sender: Arc<dyn ShardSender>,
    state_machine: Box<dyn ShardStateMachine>,
    shutdown: watch::Receiver<bool>,
) -> Result<ReplicaHandle> {
    let (tx, rx) = mpsc::channel(opts.inbox_depth);

    let mut state = ReplicaState::new(opts.node_id, opts.shard.clone(), opts.replicas.clone());
    if let Some(persisted) = storage.term_state(&opts.shard)? {
        state.term_state = persisted;
    }
    state.leader = opts.leader_hint;
    state.applied_index = storage.applied_index(&opts.shard)?;
    // On restart the commit index is re-derived from the applied index;
    // anything beyond it re-commits through the protocol.
    state.committed_index = state.applied_index;

    // Rebuild the in-memory tail above the applied index.
    let base_term = storage
        .term_at(&opts.shard, state.applied_index)?
        .unwrap_or(0);
    let mut log = ShardLog::with_base(state.applied_index + 1, base_term);
    let last = storage.last_index(&opts.shard)?;
    let mut next = state.applied_index + 1;
    while next <= last {
        let entries = storage.read(&opts.shard, next, last + 1, SYNC_READ_MAX_BYTES)?;
        if entries.is_empty() {
            break;
        }
        next = entries.last().map(|e| e.index + 1).unwrap_or(next);
        for entry in entries {
            log.append(entry)?;
        }
    }

    let shard = opts.shard.clone();
    let driver = ReplicaDriver {
        opts,
        state,
        log,
        storage,
        sender,
        state_machine,
        shutdown,
        pending: Vec::new(),
        election_deadline: Instant::now(),
    };

    let join = tokio::spawn(driver.run(rx));
    Ok(ReplicaHandle {
        shard,
        tx,
        join: parking_lot::Mutex::new(Some(join)),
    })
}

struct PendingPropose {
    index: LogIndex,
    deadline: Instant,
    reply: oneshot::Sender<Result<LogIndex>>,
}

struct ReplicaDriver {
    opts: ReplicaOptions,
    state: ReplicaState,
    log: ShardLog,
    storage: Arc<ShardLogStorage>,
    sender: Arc<dyn ShardSender>,
    state_machine: Box<dyn ShardStateMachine>,
    shutdown: watch::Receiver<bool>,
    pending: Vec<PendingPropose>,
    election_deadline: Instant,
}

enum Step {
    Event(ReplicaEvent),
    Tick,
    Shutdown,
}

impl ReplicaDriver {
    async fn run(mut self, mut inbox: mpsc::Receiver<ReplicaEvent>) {
        let mut tick = interval(self.opts.check_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_deadline();

        loop {
            let step = tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => Step::Event(event),
                    None => Step::Shutdown,
                },
                _ = tick.tick() => Step::Tick,
                _ = self.shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::Event(ReplicaEvent::Message(msg)) => self.on_message(msg),
                Step::Event(ReplicaEvent::Propose { data, log_id, reply }) => {
                    self.on_propose(data, log_id, reply)
                }
                Step::Event(ReplicaEvent::ConfigUpdate {
                    replicas,
                    leader,
                    term,
                }) => self.on_config_update(replicas, leader, term),
                Step::Event(ReplicaEvent::Status { reply }) => {
                    let _ = reply.send(self.status());
                }
                Step::Event(ReplicaEvent::Stop) | Step::Shutdown => break,
                Step::Tick => self.on_tick(),
            }

            self.apply_committed();
            self.reap_proposes();
        }

        debug!(shard = %self.opts.shard, "replica stopping");
        self.fail_pending(|| RookeryError::Canceled);
    }

    fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            role: self.state.role,
            leader: self.state.leader,
            term: self.state.current_term(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            committed_index: self.state.committed_index,
            applied_index: self.state.applied_index,
        }
    }

    // ---- timers ----

    fn on_tick(&mut self) {
        if self.state.is_leader() {
            self.broadcast_sync();
        } else if Instant::now() >= self.election_deadline {
            self.start_election();
        }
    }

    fn reset_election_deadline(&mut self) {
        let factor = rand::thread_rng().gen_range(3..6u32);
        self.election_deadline = Instant::now() + self.opts.check_interval * factor;
    }

    // ---- elections ----

    fn start_election(&mut self) {
        if !self.state.in_replica_set() {
            self.reset_election_deadline();
            return;
        }
        self.state.become_candidate();
        self.persist_term();
        self.reset_election_deadline();

        // A shard replicated only on this node elects itself outright.
        if self.state.votes.values().filter(|g| **g).count() >= self.state.quorum() {
            self.win_election();
            return;
        }

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for peer in self.state.peers().collect::<Vec<_>>() {
            self.send_to(
                peer,
                MessageType::Vote,
                0,
                Some(SyncInfo {
                    last_log_index: last_index,
                    last_log_term: last_term,
                }),
                Vec::new(),
                false,
            );
        }
    }

    fn win_election(&mut self) {
        self.state.become_leader(self.log.last_index());
        self.broadcast_sync();
        self.advance_leader_commit();
    }

    // ---- message handling ----

    fn on_message(&mut self, msg: ShardMessage) {
        if msg.to != self.opts.node_id {
            warn!(shard = %self.opts.shard, to = msg.to, "message for another node, dropped");
            return;
        }

        if msg.term > self.state.current_term() {
            let leader = match msg.msg_type {
                MessageType::Sync | MessageType::Heartbeat => msg.from,
                _ => 0,
            };
            self.state.become_follower(msg.term, leader);
            self.persist_term();
        }

        match msg.msg_type {
            MessageType::Vote => self.on_vote(msg),
            MessageType::VoteResp => self.on_vote_resp(msg),
            MessageType::Sync | MessageType::Heartbeat => self.on_sync(msg),
            MessageType::SyncAck => self.on_sync_ack(msg),
        }
    }

    fn on_vote(&mut self, msg: ShardMessage) {
        let candidate_log = msg.sync_info.unwrap_or_default();
        let granted = msg.term >= self.state.current_term()
            && self
                .state
                .term_state
                .voted_for
                .map(|v| v == msg.from)
                .unwrap_or(true)
            && self
                .log
                .is_up_to_date(candidate_log.last_log_index, candidate_log.last_log_term);

        if granted {
            self.state.term_state.voted_for = Some(msg.from);
            self.persist_term();
            self.reset_election_deadline();
        }

        debug!(
            shard = %self.opts.shard,
            candidate = msg.from,
            term = msg.term,
            granted,
            "handled vote request"
        );
        self.send_to(msg.from, MessageType::VoteResp, 0, None, Vec::new(), !granted);
    }

    fn on_vote_resp(&mut self, msg: ShardMessage) {
        if !self.state.role.is_candidate() || msg.term != self.state.current_term() {
            return;
        }
        if self.state.record_vote(msg.from, !msg.reject) {
            self.win_election();
        }
    }

    /// Follower path for Sync and Heartbeat (a heartbeat is an entry-less
    /// sync carrying the leader's commit index).
    fn on_sync(&mut self, msg: ShardMessage) {
        if msg.term < self.state.current_term() {
            // Stale leader; the rejection carries our term so it steps down.
            self.send_ack(msg.from, true);
            return;
        }

        if self.state.role != ReplicaRole::Follower || self.state.leader != msg.from {
            let term = self.state.current_term();
            self.state.become_follower(term, msg.from);
        }
        self.reset_election_deadline();

        let prev = msg.sync_info.unwrap_or_default();
        if !self.log_matches(prev.last_log_index, prev.last_log_term) {
            debug!(
                shard = %self.opts.shard,
                prev_index = prev.last_log_index,
                prev_term = prev.last_log_term,
                last = self.log.last_index(),
                "sync rejected, log mismatch"
            );
            self.send_ack(msg.from, true);
            return;
        }

        if !msg.entries.is_empty() {
            if let Err(e) = self.accept_entries(msg.entries) {
                error!(shard = %self.opts.shard, error = %e, "failed to accept entries");
                self.send_ack(msg.from, true);
                return;
            }
        }

        let new_commit = msg.commit.min(self.log.last_index());
        if new_commit > self.state.committed_index {
            self.advance_commit_to(new_commit);
        }

        self.send_ack(msg.from, false);
    }

    fn log_matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        match self.log.matches(prev_index, prev_term) {
            Some(ok) => ok,
            // Below the in-memory tail; the durable log decides.
            None => match self.storage.term_at(&self.opts.shard, prev_index) {
                Ok(Some(term)) => term == prev_term,
                Ok(None) => false,
                Err(e) => {
                    error!(shard = %self.opts.shard, error = %e, "term lookup failed");
                    false
                }
            },
        }
    }

    fn accept_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        let mut fresh: Vec<LogEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index <= self.log.last_index() {
                let existing_term = self.log.term_at(entry.index);
                if existing_term == Some(entry.term) {
                    // Already have it.
                    continue;
                }
                if entry.index <= self.state.committed_index {
                    return Err(RookeryError::Corrupt(format!(
                        "conflict below commit index {} at {}",
                        self.state.committed_index, entry.index
                    )));
                }
                self.log.truncate_from(entry.index);
                self.storage.truncate_from(&self.opts.shard, entry.index)?;
                fresh.push(entry);
            } else {
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        self.storage.append(&self.opts.shard, &fresh)?;
        for entry in fresh {
            self.log.append(entry)?;
        }
        Ok(())
    }

    fn on_sync_ack(&mut self, msg: ShardMessage) {
        if !self.state.is_leader() || msg.term != self.state.current_term() {
            return;
        }
        if msg.reject {
            self.state.backoff(msg.from, msg.index);
            // Retry right away instead of waiting a full tick.
            self.send_sync_to(msg.from);
            return;
        }
        let ack = msg.sync_info.unwrap_or(SyncInfo {
            last_log_index: msg.index,
            last_log_term: 0,
        });
        self.state
            .record_sync_ack(msg.from, ack.last_log_index, ack.last_log_term);
        self.advance_leader_commit();

        // Keep pushing if the follower is still behind.
        let behind = self
            .state
            .progress
            .get(&msg.from)
            .map(|p| p.next_index <= self.log.last_index())
            .unwrap_or(false);
        if behind {
            self.send_sync_to(msg.from);
        }
    }

    // ---- propose ----

    fn on_propose(
        &mut self,
        data: Vec<u8>,
        log_id: u64,
        reply: oneshot::Sender<Result<LogIndex>>,
    ) {
        if !self.state.is_leader() {
            let leader = (self.state.leader != 0).then_some(self.state.leader);
            let _ = reply.send(Err(RookeryError::NotLeader { leader }));
            return;
        }

        // A re-submitted propose with a known id maps to the entry it
        // already created.
        if let Some(existing) = self.log.find_by_id(log_id) {
            if existing <= self.state.committed_index {
                let _ = reply.send(Ok(existing));
            } else {
                self.pending.push(PendingPropose {
                    index: existing,
                    deadline: Instant::now() + self.opts.propose_timeout,
                    reply,
                });
            }
            return;
        }

        let index = self.log.last_index() + 1;
        let entry = LogEntry::new(self.state.current_term(), index, log_id, data);
        if let Err(e) = self.storage.append(&self.opts.shard, &[entry.clone()]) {
            error!(shard = %self.opts.shard, error = %e, "propose append failed");
            let _ = reply.send(Err(e));
            return;
        }
        if let Err(e) = self.log.append(entry) {
            let _ = reply.send(Err(e));
            return;
        }

        self.pending.push(PendingPropose {
            index,
            deadline: Instant::now() + self.opts.propose_timeout,
            reply,
        });

        self.broadcast_sync();
        self.advance_leader_commit();
    }

    // ---- replication ----

    fn broadcast_sync(&mut self) {
        for peer in self.state.peers().collect::<Vec<_>>() {
            self.send_sync_to(peer);
        }
    }

    fn send_sync_to(&mut self, peer: NodeId) {
        let Some(progress) = self.state.progress.get(&peer) else {
            return;
        };
        let next = progress.next_index;
        let prev_index = next.saturating_sub(1);
        let prev_term = self.term_at_any(prev_index);

        let entries = if next > self.log.last_index() {
            Vec::new()
        } else if next >= self.log.first_index() {
            self.log
                .entries_from_limit(next, self.opts.sync_limit as usize)
        } else {
            // Follower is behind the in-memory tail; fill from storage.
            // Short reads are fine, the next ack round continues.
            let end = self
                .log
                .first_index()
                .min(next + self.opts.sync_limit as u64);
            match self.storage.read(&self.opts.shard, next, end, SYNC_READ_MAX_BYTES) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(shard = %self.opts.shard, error = %e, "sync fill read failed");
                    Vec::new()
                }
            }
        };

        let msg_type = if entries.is_empty() {
            MessageType::Heartbeat
        } else {
            MessageType::Sync
        };
        self.send_to(
            peer,
            msg_type,
            next,
            Some(SyncInfo {
                last_log_index: prev_index,
                last_log_term: prev_term,
            }),
            entries,
            false,
        );
    }

    fn term_at_any(&self, index: LogIndex) -> Term {
        if let Some(term) = self.log.term_at(index) {
            return term;
        }
        match self.storage.term_at(&self.opts.shard, index) {
            Ok(Some(term)) => term,
            _ => 0,
        }
    }

    /// Leader-side commit rule: largest quorum-held index whose entry is
    /// from the current term.
    fn advance_leader_commit(&mut self) {
        if !self.state.is_leader() {
            return;
        }
        let candidate = self.state.quorum_match_index(self.log.last_index());
        if candidate <= self.state.committed_index {
            return;
        }
        if self.term_at_any(candidate) != self.state.current_term() {
            return;
        }
        self.advance_commit_to(candidate);
    }

    fn advance_commit_to(&mut self, new_commit: LogIndex) {
        let old = self.state.committed_index;
        self.state.committed_index = new_commit;
        self.state_machine.on_commit(old, new_commit);

        // Resolve proposes that made it in.
        let committed = self.state.committed_index;
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].index <= committed {
                let p = self.pending.swap_remove(i);
                let _ = p.reply.send(Ok(p.index));
            } else {
                i += 1;
            }
        }
    }

    // ---- apply ----

    fn apply_committed(&mut self) {
        while self.state.applied_index < self.state.committed_index {
            let batch = self.log.entries_range_limit(
                self.state.applied_index,
                self.state.committed_index,
                self.opts.commit_limit as usize,
            );
            if batch.is_empty() {
                break;
            }
            match self.state_machine.apply(&batch) {
                Ok(new_applied) => {
                    let new_applied = new_applied
                        .max(self.state.applied_index)
                        .min(self.state.committed_index);
                    if new_applied == self.state.applied_index {
                        break;
                    }
                    self.state.applied_index = new_applied;
                    if let Err(e) = self
                        .storage
                        .set_applied_index(&self.opts.shard, new_applied)
                    {
                        error!(shard = %self.opts.shard, error = %e, "persist applied index failed");
                    }
                }
                Err(e) => {
                    // Leave the applied index alone; the next event or
                    // tick retries the same batch.
                    error!(shard = %self.opts.shard, error = %e, "apply failed");
                    break;
                }
            }
        }
    }

    // ---- config ----

    /// Apply an externally-coordinated configuration: replica set changes
    /// and leadership decided outside the in-band protocol (initial slot
    /// assignment, channel elections). In-band elections still take over
    /// whenever the installed leader goes quiet.
    fn on_config_update(&mut self, replicas: Vec<NodeId>, leader: NodeId, term: Term) {
        if !replicas.is_empty() && replicas != self.state.replicas {
            info!(
                shard = %self.opts.shard,
                ?replicas,
                "replica set updated"
            );
            self.state.replicas = replicas;
            if self.state.is_leader() {
                let last = self.log.last_index();
                let known: Vec<NodeId> = self.state.peers().collect();
                self.state.progress.retain(|id, _| known.contains(id));
                for peer in known {
                    self.state.progress.entry(peer).or_insert_with(|| {
                        super::state::FollowerProgress {
                            next_index: last + 1,
                            sync_info: SyncInfo::default(),
                        }
                    });
                }
            }
        }

        let current = self.state.current_term();
        if leader != 0 && term >= current {
            if leader == self.opts.node_id {
                if !self.state.is_leader() || term > current {
                    self.state.term_state.current_term = term.max(current);
                    self.state.term_state.voted_for = Some(self.opts.node_id);
                    self.persist_term();
                    self.win_election();
                }
            } else if term > current || self.state.is_leader() || self.state.leader != leader {
                self.state.become_follower(term.max(current), leader);
                if term > current {
                    self.persist_term();
                }
                self.reset_election_deadline();
            }
        } else if term > current {
            self.state.become_follower(term, leader);
            self.persist_term();
        }

        if self.state.is_leader() && !self.state.in_replica_set() {
            // Configuration removed our leadership.
            let term = self.state.current_term();
            self.state.become_follower(term, 0);
        }
    }

    // ---- plumbing ----

    fn reap_proposes(&mut self) {
        let now = Instant::now();
        let committed = self.state.committed_index;
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].index > committed && now >= self.pending[i].deadline {
                let p = self.pending.swap_remove(i);
                let _ = p.reply.send(Err(RookeryError::ProposeTimeout));
            } else {
                i += 1;
            }
        }
    }

    fn fail_pending<F: Fn() -> RookeryError>(&mut self, err: F) {
        for p in self.pending.drain(..) {
            let _ = p.reply.send(Err(err()));
        }
    }

    fn persist_term(&mut self) {
        if let Err(e) = self
            .storage
            .set_term_state(&self.opts.shard, &self.state.term_state)
        {
            error!(shard = %self.opts.shard, error = %e, "persist term state failed");
        }
    }

    fn send_ack(&mut self, to: NodeId, reject: bool) {
        let info = SyncInfo {
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        self.send_to(
            to,
            MessageType::SyncAck,
            self.log.last_index(),
            Some(info),
            Vec::new(),
            reject,
        );
    }

    fn send_to(
        &mut self,
        to: NodeId,
        msg_type: MessageType,
        index: LogIndex,
        sync_info: Option<SyncInfo>,
        entries: Vec<LogEntry>,
        reject: bool,
    ) {
        let msg = ShardMessage {
            handler_key: self.opts.shard.clone(),
            from: self.opts.node_id,
            to,
            msg_type,
            term: self.state.current_term(),
            index,
            commit: self.state.committed_index,
            entries,
            sync_info,
            reject,
        };
        self.sender.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::message::MessageType;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingMachine {
        applied: Arc<Mutex<Vec<LogEntry>>>,
        commits: Arc<Mutex<Vec<(LogIndex, LogIndex)>>>,
    }

    impl ShardStateMachine for RecordingMachine {
        fn apply(&mut self, entries: &[LogEntry]) -> Result<LogIndex> {
            let mut applied = self.applied.lock();
            applied.extend(entries.iter().cloned());
            Ok(entries.last().map(|e| e.index).unwrap_or(0))
        }

        fn on_commit(&mut self, old: LogIndex, new: LogIndex) {
            self.commits.lock().push((old, new));
        }
    }

    #[derive(Clone, Default)]
    struct Outbox {
        msgs: Arc<Mutex<VecDeque<ShardMessage>>>,
    }

    impl ShardSender for Outbox {
        fn send(&self, msg: ShardMessage) {
            self.msgs.lock().push_back(msg);
        }
    }

    impl Outbox {
        fn drain(&self) -> Vec<ShardMessage> {
            self.msgs.lock().drain(..).collect()
        }

        async fn wait_for(
            &self,
            msg_type: MessageType,
            timeout: Duration,
        ) -> Option<ShardMessage> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                {
                    let mut msgs = self.msgs.lock();
                    if let Some(pos) = msgs.iter().position(|m| m.msg_type == msg_type) {
                        return msgs.remove(pos);
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn test_opts(node_id: NodeId, replicas: Vec<NodeId>) -> ReplicaOptions {
        ReplicaOptions {
            node_id,
            shard: "0".to_string(),
            replicas,
            check_interval: Duration::from_millis(20),
            propose_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    struct Fixture {
        handle: ReplicaHandle,
        outbox: Outbox,
        applied: Arc<Mutex<Vec<LogEntry>>>,
        commits: Arc<Mutex<Vec<(LogIndex, LogIndex)>>>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn start(node_id: NodeId, replicas: Vec<NodeId>) -> Fixture {
        let dir = tempdir().unwrap();
        let storage = Arc::new(ShardLogStorage::open(dir.path()).unwrap());
        let outbox = Outbox::default();
        let machine = RecordingMachine::default();
        let applied = Arc::clone(&machine.applied);
        let commits = Arc::clone(&machine.commits);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = start_replica(
            test_opts(node_id, replicas),
            storage,
            Arc::new(outbox.clone()),
            Box::new(machine),
            shutdown_rx,
        )
        .unwrap();
        Fixture {
            handle,
            outbox,
            applied,
            commits,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn single_replica_elects_and_commits() {
        let fx = start(1, vec![1]);

        // The election timer fires within a few check intervals.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = fx.handle.status().await.unwrap();
        assert!(status.role.is_leader());
        assert!(status.term >= 2);

        let index = fx.handle.propose(vec![0xCA, 0xFE], 99).await.unwrap();
        assert_eq!(index, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let applied = fx.applied.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].data_bytes(), &[0xCA, 0xFE]);
        assert_eq!(fx.commits.lock().as_slice(), &[(0, 1)]);

        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn propose_on_follower_returns_not_leader() {
        let fx = start(2, vec![1, 2, 3]);

        // Install a known leader before any election fires.
        fx.handle
            .add_message(ShardMessage {
                handler_key: "0".into(),
                from: 1,
                to: 2,
                msg_type: MessageType::Heartbeat,
                term: 2,
                index: 1,
                commit: 0,
                entries: vec![],
                sync_info: Some(SyncInfo::default()),
                reject: false,
            })
            .await
            .unwrap();

        let err = fx.handle.propose(vec![1], 1).await.unwrap_err();
        match err {
            RookeryError::NotLeader { leader } => assert_eq!(leader, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn follower_acks_sync_and_applies_on_commit() {
        let fx = start(2, vec![1, 2, 3]);

        let entry = LogEntry::new(2, 1, 500, vec![0xAB]);
        fx.handle
            .add_message(ShardMessage {
                handler_key: "0".into(),
                from: 1,
                to: 2,
                msg_type: MessageType::Sync,
                term: 2,
                index: 1,
                commit: 0,
                entries: vec![entry],
                sync_info: Some(SyncInfo::default()),
                reject: false,
            })
            .await
            .unwrap();

        let ack = fx
            .outbox
            .wait_for(MessageType::SyncAck, Duration::from_secs(1))
            .await
            .expect("ack");
        assert!(!ack.reject);
        assert_eq!(ack.index, 1);
        assert_eq!(ack.to, 1);

        // Leader advances commit; follower applies on the next heartbeat.
        fx.handle
            .add_message(ShardMessage {
                handler_key: "0".into(),
                from: 1,
                to: 2,
                msg_type: MessageType::Heartbeat,
                term: 2,
                index: 2,
                commit: 1,
                entries: vec![],
                sync_info: Some(SyncInfo {
                    last_log_index: 1,
                    last_log_term: 2,
                }),
                reject: false,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.applied.lock().len(), 1);
        assert_eq!(fx.commits.lock().as_slice(), &[(0, 1)]);
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn follower_rejects_mismatched_sync() {
        let fx = start(2, vec![1, 2, 3]);

        // prev (5, 2) does not exist here.
        fx.handle
            .add_message(ShardMessage {
                handler_key: "0".into(),
                from: 1,
                to: 2,
                msg_type: MessageType::Sync,
                term: 2,
                index: 6,
                commit: 0,
                entries: vec![LogEntry::new(2, 6, 1, vec![1])],
                sync_info: Some(SyncInfo {
                    last_log_index: 5,
                    last_log_term: 2,
                }),
                reject: false,
            })
            .await
            .unwrap();

        let ack = fx
            .outbox
            .wait_for(MessageType::SyncAck, Duration::from_secs(1))
            .await
            .expect("ack");
        assert!(ack.reject);
        assert_eq!(ack.index, 0);
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn vote_granted_once_per_term() {
        let fx = start(2, vec![1, 2, 3]);

        let vote = |from: NodeId| ShardMessage {
            handler_key: "0".into(),
            from,
            to: 2,
            msg_type: MessageType::Vote,
            term: 5,
            index: 0,
            commit: 0,
            entries: vec![],
            sync_info: Some(SyncInfo::default()),
            reject: false,
        };

        fx.handle.add_message(vote(1)).await.unwrap();
        let resp = fx
            .outbox
            .wait_for(MessageType::VoteResp, Duration::from_secs(1))
            .await
            .expect("resp");
        assert!(!resp.reject);
        assert_eq!(resp.to, 1);

        // Same term, different candidate: refused.
        fx.handle.add_message(vote(3)).await.unwrap();
        let resp = fx
            .outbox
            .wait_for(MessageType::VoteResp, Duration::from_secs(1))
            .await
            .expect("resp");
        assert!(resp.reject);
        assert_eq!(resp.to, 3);
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn propose_times_out_without_quorum() {
        let fx = start(1, vec![1, 2, 3]);

        // Force leadership by granting a vote from peer 2.
        let vote = fx
            .outbox
            .wait_for(MessageType::Vote, Duration::from_secs(2))
            .await
            .expect("vote request");
        fx.handle
            .add_message(ShardMessage {
                handler_key: "0".into(),
                from: 2,
                to: 1,
                msg_type: MessageType::VoteResp,
                term: vote.term,
                index: 0,
                commit: 0,
                entries: vec![],
                sync_info: None,
                reject: false,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = fx.handle.status().await.unwrap();
        assert!(status.role.is_leader());

        // No follower ever acks, so the propose cannot commit.
        let err = fx.handle.propose(vec![9], 1).await.unwrap_err();
        assert!(matches!(err, RookeryError::ProposeTimeout));
        fx.handle.stop().await;
    }

    #[tokio::test]
    async fn resubmitted_propose_is_deduplicated() {
        let fx = start(1, vec![1]);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let first = fx.handle.propose(vec![7], 42).await.unwrap();
        let second = fx.handle.propose(vec![7], 42).await.unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.applied.lock().len(), 1);
        fx.handle.stop().await;
    }
}
