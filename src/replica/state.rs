//! Per-shard replication state.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::message::SyncInfo;

/// Role of a replica within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    Follower,
    Candidate,
    Leader,
}

impl ReplicaRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, ReplicaRole::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, ReplicaRole::Candidate)
    }
}

impl std::fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaRole::Follower => write!(f, "follower"),
            ReplicaRole::Candidate => write!(f, "candidate"),
            ReplicaRole::Leader => write!(f, "leader"),
        }
    }
}

/// Term and vote, persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Leader-side replication bookkeeping for one follower.
#[derive(Debug, Clone, Default)]
pub struct FollowerProgress {
    /// Next index to send.
    pub next_index: LogIndex,
    /// Last position the follower confirmed.
    pub sync_info: SyncInfo,
}

/// Complete volatile + persistent state of one shard replica.
#[derive(Debug)]
pub struct ReplicaState {
    pub node_id: NodeId,
    pub shard: String,
    pub role: ReplicaRole,
    /// Known leader of the shard, 0 when unknown.
    pub leader: NodeId,
    pub term_state: TermState,
    pub committed_index: LogIndex,
    pub applied_index: LogIndex,
    /// Replica set including this node.
    pub replicas: Vec<NodeId>,
    /// Leader-only: per-follower progress. Reset on every election win.
    pub progress: HashMap<NodeId, FollowerProgress>,
    /// Candidate-only: voters that granted this term.
    pub votes: HashMap<NodeId, bool>,
}

impl ReplicaState {
    pub fn new(node_id: NodeId, shard: impl Into<String>, replicas: Vec<NodeId>) -> Self {
        Self {
            node_id,
            shard: shard.into(),
            role: ReplicaRole::Follower,
            leader: 0,
            term_state: TermState {
                current_term: 1,
                voted_for: None,
            },
            committed_index: 0,
            applied_index: 0,
            replicas,
            progress: HashMap::new(),
            votes: HashMap::new(),
        }
    }

    pub fn current_term(&self) -> Term {
        self.term_state.current_term
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    /// Peers in the replica set (everyone but this node).
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.node_id;
        self.replicas.iter().copied().filter(move |id| *id != me)
    }

    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    pub fn in_replica_set(&self) -> bool {
        self.replicas.contains(&self.node_id)
    }

    /// Step down to follower at `term`. Clears the vote only when the term
    /// actually advances.
    pub fn become_follower(&mut self, term: Term, leader: NodeId) {
        if term > self.term_state.current_term {
            self.term_state.current_term = term;
            self.term_state.voted_for = None;
        }
        self.role = ReplicaRole::Follower;
        self.leader = leader;
        self.progress.clear();
        self.votes.clear();

        tracing::info!(
            node_id = self.node_id,
            shard = %self.shard,
            term,
            leader,
            "became follower"
        );
    }

    /// Start an election: bump the term, vote for self.
    pub fn become_candidate(&mut self) {
        self.role = ReplicaRole::Candidate;
        self.term_state.current_term += 1;
        self.term_state.voted_for = Some(self.node_id);
        self.leader = 0;
        self.progress.clear();
        self.votes.clear();
        self.votes.insert(self.node_id, true);

        tracing::info!(
            node_id = self.node_id,
            shard = %self.shard,
            term = self.term_state.current_term,
            "became candidate"
        );
    }

    /// Take leadership; followers start from the leader's tail.
    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.role = ReplicaRole::Leader;
        self.leader = self.node_id;
        self.votes.clear();
        self.progress.clear();
        for peer in self.replicas.clone() {
            if peer == self.node_id {
                continue;
            }
            self.progress.insert(
                peer,
                FollowerProgress {
                    next_index: last_log_index + 1,
                    sync_info: SyncInfo::default(),
                },
            );
        }

        tracing::info!(
            node_id = self.node_id,
            shard = %self.shard,
            term = self.term_state.current_term,
            "became leader"
        );
    }

    /// Record a vote response. Returns true once a majority granted.
    pub fn record_vote(&mut self, from: NodeId, granted: bool) -> bool {
        self.votes.insert(from, granted);
        let granted_count = self.votes.values().filter(|g| **g).count();
        granted_count >= self.quorum()
    }

    /// Record a follower ack and advance its progress. Out-of-order acks
    /// resolve by max-match.
    pub fn record_sync_ack(&mut self, from: NodeId, match_index: LogIndex, match_term: Term) {
        if let Some(progress) = self.progress.get_mut(&from) {
            if match_index >= progress.sync_info.last_log_index {
                progress.sync_info = SyncInfo {
                    last_log_index: match_index,
                    last_log_term: match_term,
                };
            }
            if match_index + 1 > progress.next_index {
                progress.next_index = match_index + 1;
            }
        }
    }

    /// Back a follower's next index off after a rejected sync.
    pub fn backoff(&mut self, from: NodeId, follower_last: LogIndex) {
        if let Some(progress) = self.progress.get_mut(&from) {
            // The follower told us where its log ends; probing below that
            // is never necessary.
            let candidate = progress.next_index.saturating_sub(1).max(1);
            progress.next_index = candidate.min(follower_last + 1).max(1);
        }
    }

    /// Commit candidate: the largest index present on a majority. The
    /// caller still has to check the entry's term equals `current_term`
    /// before advancing the commit index.
    pub fn quorum_match_index(&self, leader_last: LogIndex) -> LogIndex {
        let mut indices: Vec<LogIndex> = self
            .progress
            .values()
            .map(|p| p.sync_info.last_log_index)
            .collect();
        indices.push(leader_last);
        indices.sort_unstable();
        indices.reverse();
        let quorum_idx = self.quorum() - 1;
        indices.get(quorum_idx).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_term_is_one() {
        let state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.role, ReplicaRole::Follower);
        assert_eq!(state.quorum(), 2);
    }

    #[test]
    fn candidate_bumps_term_and_votes_self() {
        let mut state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        state.become_candidate();
        assert_eq!(state.current_term(), 2);
        assert_eq!(state.term_state.voted_for, Some(1));
        assert!(state.role.is_candidate());
    }

    #[test]
    fn majority_wins_election() {
        let mut state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        state.become_candidate();
        assert!(state.record_vote(2, true)); // self + one peer = 2 of 3
    }

    #[test]
    fn single_replica_quorum_is_one() {
        let mut state = ReplicaState::new(1, "0", vec![1]);
        state.become_candidate();
        let granted = state.votes.values().filter(|g| **g).count();
        assert!(granted >= state.quorum());
    }

    #[test]
    fn follower_keeps_vote_on_same_term() {
        let mut state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        state.term_state.voted_for = Some(2);
        let term = state.current_term();
        state.become_follower(term, 2);
        assert_eq!(state.term_state.voted_for, Some(2));
        state.become_follower(term + 1, 0);
        assert_eq!(state.term_state.voted_for, None);
    }

    #[test]
    fn quorum_match_with_out_of_order_acks() {
        let mut state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        state.become_candidate();
        state.become_leader(30);

        // Ack for [20..30) arrives before the one for [10..20).
        state.record_sync_ack(2, 30, 2);
        state.record_sync_ack(2, 20, 2);
        assert_eq!(state.progress[&2].sync_info.last_log_index, 30);

        assert_eq!(state.quorum_match_index(30), 30);
        state.record_sync_ack(3, 10, 2);
        assert_eq!(state.quorum_match_index(30), 30);
    }

    #[test]
    fn backoff_respects_follower_tail() {
        let mut state = ReplicaState::new(1, "0", vec![1, 2, 3]);
        state.become_candidate();
        state.become_leader(100);
        state.backoff(2, 5);
        assert_eq!(state.progress[&2].next_index, 6);
        state.backoff(2, 5);
        assert_eq!(state.progress[&2].next_index, 5);
    }
}
