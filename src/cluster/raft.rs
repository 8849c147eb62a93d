// Raft-style replicated log: leader election with optional pre-vote, log
// replication with fast conflict back-off, and commit index advancement
// gated on the current term. Peer RPCs are abstracted behind `RaftTransport`
// so the state machine can be driven by an in-memory transport in tests and
// by the wire layer's peer framing in production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{DbError, Result};

pub type RaftNodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    fn to_u8(self) -> u8 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }

    fn from_u8(b: u8) -> Self {
        match b {
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Follower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum LogEntryKind {
    Command,
    Config,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub kind: LogEntryKind,
    pub payload: Vec<u8>,
}

/// Membership list, with an optional `new_members` set during joint
/// consensus. A majority in both the old and new set is required to commit
/// while `new_members` is populated.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterConfiguration {
    pub members: Vec<RaftNodeId>,
    pub new_members: Option<Vec<RaftNodeId>>,
}

impl ClusterConfiguration {
    pub fn new(members: Vec<RaftNodeId>) -> Self {
        Self { members, new_members: None }
    }

    pub fn is_joint_consensus(&self) -> bool {
        self.new_members.is_some()
    }

    pub fn all_members(&self) -> Vec<RaftNodeId> {
        let mut all = self.members.clone();
        if let Some(new) = &self.new_members {
            for member in new {
                if !all.contains(member) {
                    all.push(*member);
                }
            }
        }
        all
    }

    pub fn has_joint_quorum(&self, votes: &HashMap<RaftNodeId, bool>) -> bool {
        if !self.is_joint_consensus() {
            return self.has_quorum(votes);
        }
        let old_ok = Self::count_quorum(&self.members, votes);
        let new_ok = self.new_members.as_ref().map(|m| Self::count_quorum(m, votes)).unwrap_or(false);
        old_ok && new_ok
    }

    pub fn has_quorum(&self, votes: &HashMap<RaftNodeId, bool>) -> bool {
        Self::count_quorum(&self.members, votes)
    }

    fn count_quorum(members: &[RaftNodeId], votes: &HashMap<RaftNodeId, bool>) -> bool {
        let yes = members.iter().filter(|id| votes.get(id).copied().unwrap_or(false)).count();
        yes > members.len() / 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: RaftNodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// A pre-vote does not mutate the candidate's `current_term` on
    /// rejection and is evaluated the same as a real vote otherwise.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: RaftNodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: Option<LogIndex>,
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn send_vote_request(&self, peer: RaftNodeId, req: VoteRequest) -> Result<VoteResponse>;
    async fn send_append_entries(&self, peer: RaftNodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}

struct PersistentState {
    current_term: Term,
    voted_for: Option<RaftNodeId>,
    /// Dense from index 1; `log[0]` is the sentinel (`index = 0`).
    log: Vec<LogEntry>,
}

impl PersistentState {
    fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry { term: 0, index: 0, kind: LogEntryKind::Noop, payload: Vec::new() }],
        }
    }

    fn last_index(&self) -> LogIndex {
        self.log.last().expect("sentinel always present").index
    }

    fn last_term(&self) -> Term {
        self.log.last().expect("sentinel always present").term
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.log.get(index as usize).map(|e| e.term)
    }

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.get(index as usize)
    }

    fn append(&mut self, entries: Vec<LogEntry>) {
        self.log.extend(entries);
    }

    fn truncate_from(&mut self, index: LogIndex) {
        self.log.truncate(index as usize);
    }

    /// First index of the conflicting term, for fast back-off.
    fn first_index_of_term(&self, term: Term) -> LogIndex {
        self.log.iter().find(|e| e.term == term).map(|e| e.index).unwrap_or(1)
    }
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: RaftNodeId,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub pre_vote_enabled: bool,
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: 0,
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(150),
            pre_vote_enabled: true,
            rpc_timeout: Duration::from_millis(1500),
        }
    }
}

pub struct RaftNode<T: RaftTransport> {
    config: RaftConfig,
    transport: Arc<T>,
    state: Mutex<PersistentState>,
    role: AtomicU8,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    leader_id: RwLock<Option<RaftNodeId>>,
    cluster_config: RwLock<ClusterConfiguration>,
    next_index: Mutex<HashMap<RaftNodeId, LogIndex>>,
    match_index: Mutex<HashMap<RaftNodeId, LogIndex>>,
    apply_tx: mpsc::Sender<LogEntry>,
}

impl<T: RaftTransport + 'static> RaftNode<T> {
    pub fn new(
        config: RaftConfig,
        transport: Arc<T>,
        members: Vec<RaftNodeId>,
    ) -> (Arc<Self>, mpsc::Receiver<LogEntry>) {
        let (apply_tx, apply_rx) = mpsc::channel(256);
        let node = Arc::new(Self {
            config,
            transport,
            state: Mutex::new(PersistentState::new()),
            role: AtomicU8::new(Role::Follower.to_u8()),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            leader_id: RwLock::new(None),
            cluster_config: RwLock::new(ClusterConfiguration::new(members)),
            next_index: Mutex::new(HashMap::new()),
            match_index: Mutex::new(HashMap::new()),
            apply_tx,
        });
        (node, apply_rx)
    }

    pub fn id(&self) -> RaftNodeId {
        self.config.id
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> Option<RaftNodeId> {
        *self.leader_id.read()
    }

    fn set_role(&self, role: Role) {
        self.role.store(role.to_u8(), Ordering::Release);
    }

    fn peers(&self) -> Vec<RaftNodeId> {
        self.cluster_config.read().all_members().into_iter().filter(|&id| id != self.config.id).collect()
    }

    fn randomized_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let millis = rand::rng().random_range(min..max.max(min + 1));
        Duration::from_millis(millis)
    }

    /// Step down to follower if `term` is newer than ours. Returns true if
    /// a step-down happened.
    fn maybe_step_down(&self, term: Term) -> bool {
        let mut state = self.state.lock();
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            drop(state);
            self.set_role(Role::Follower);
            true
        } else {
            false
        }
    }

    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        if !req.pre_vote {
            self.maybe_step_down(req.term);
        }

        let state = self.state.lock();
        let current_term = state.current_term;
        if req.term < current_term {
            return VoteResponse { term: current_term, vote_granted: false, pre_vote: req.pre_vote };
        }

        let log_ok = req.last_log_term > state.last_term()
            || (req.last_log_term == state.last_term() && req.last_log_index >= state.last_index());

        let can_vote = req.pre_vote
            || state.voted_for.is_none()
            || state.voted_for == Some(req.candidate_id);

        let grant = req.term >= current_term && log_ok && can_vote;
        drop(state);

        if grant && !req.pre_vote {
            let mut state = self.state.lock();
            state.voted_for = Some(req.candidate_id);
        }

        VoteResponse { term: self.current_term(), vote_granted: grant, pre_vote: req.pre_vote }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        self.maybe_step_down(req.term);
        let current_term = self.current_term();
        if req.term < current_term {
            return AppendEntriesResponse { term: current_term, success: false, match_index: None, conflict_index: None, conflict_term: None };
        }

        *self.leader_id.write() = Some(req.leader_id);
        self.set_role(Role::Follower);

        let mut state = self.state.lock();
        match state.term_at(req.prev_log_index) {
            None => {
                let conflict_index = state.last_index() + 1;
                return AppendEntriesResponse { term: current_term, success: false, match_index: None, conflict_index: Some(conflict_index), conflict_term: None };
            }
            Some(term) if term != req.prev_log_term => {
                let conflict_term = term;
                let conflict_index = state.first_index_of_term(conflict_term);
                return AppendEntriesResponse { term: current_term, success: false, match_index: None, conflict_index: Some(conflict_index), conflict_term: Some(conflict_term) };
            }
            _ => {}
        }

        state.truncate_from(req.prev_log_index + 1);
        state.append(req.entries.clone());
        let last_new_index = state.last_index();
        drop(state);

        if req.leader_commit > self.commit_index.load(Ordering::Acquire) {
            let new_commit = req.leader_commit.min(last_new_index);
            self.commit_index.store(new_commit, Ordering::Release);
            self.drain_applicable().await;
        }

        AppendEntriesResponse { term: current_term, success: true, match_index: Some(last_new_index), conflict_index: None, conflict_term: None }
    }

    async fn drain_applicable(&self) {
        loop {
            let applied = self.last_applied.load(Ordering::Acquire);
            let commit = self.commit_index.load(Ordering::Acquire);
            if applied >= commit {
                break;
            }
            let next = applied + 1;
            let entry = {
                let state = self.state.lock();
                state.entry_at(next).cloned()
            };
            let Some(entry) = entry else { break };
            if self.apply_tx.send(entry).await.is_err() {
                break;
            }
            self.last_applied.store(next, Ordering::Release);
        }
    }

    /// Leader-only: append a command entry and return its index once
    /// accepted locally (not yet committed).
    pub async fn propose(&self, payload: Vec<u8>, kind: LogEntryKind) -> Result<LogIndex> {
        if self.role() != Role::Leader {
            return Err(DbError::NotLeader(self.leader_id().map(|id| id.to_string())));
        }
        let index = {
            let mut state = self.state.lock();
            let term = state.current_term;
            let index = state.last_index() + 1;
            state.append(vec![LogEntry { term, index, kind, payload }]);
            index
        };
        self.replicate_once().await;
        Ok(index)
    }

    /// Run a pre-vote round (if enabled) then a real election. Returns
    /// `true` if this node became leader.
    pub async fn run_election(&self) -> Result<bool> {
        if self.config.pre_vote_enabled {
            let would_win = self.run_pre_vote().await;
            if !would_win {
                return Ok(false);
            }
        }

        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock();
            state.current_term += 1;
            state.voted_for = Some(self.config.id);
            (state.current_term, state.last_index(), state.last_term())
        };
        self.set_role(Role::Candidate);

        let peers = self.peers();
        let mut votes: HashMap<RaftNodeId, bool> = HashMap::new();
        votes.insert(self.config.id, true);

        for peer in peers {
            let req = VoteRequest { term, candidate_id: self.config.id, last_log_index, last_log_term, pre_vote: false };
            match tokio::time::timeout(self.config.rpc_timeout, self.transport.send_vote_request(peer, req)).await {
                Ok(Ok(resp)) => {
                    if resp.term > term {
                        self.maybe_step_down(resp.term);
                        return Ok(false);
                    }
                    votes.insert(peer, resp.vote_granted);
                }
                _ => {
                    votes.insert(peer, false);
                }
            }
        }

        if self.current_term() != term || self.role() != Role::Candidate {
            return Ok(false);
        }

        let config = self.cluster_config.read().clone();
        if !config.has_joint_quorum(&votes) {
            return Ok(false);
        }

        self.become_leader(term).await;
        Ok(true)
    }

    async fn run_pre_vote(&self) -> bool {
        let (term_plus_one, last_log_index, last_log_term) = {
            let state = self.state.lock();
            (state.current_term + 1, state.last_index(), state.last_term())
        };

        let peers = self.peers();
        let mut votes: HashMap<RaftNodeId, bool> = HashMap::new();
        votes.insert(self.config.id, true);

        for peer in peers {
            let req = VoteRequest { term: term_plus_one, candidate_id: self.config.id, last_log_index, last_log_term, pre_vote: true };
            match tokio::time::timeout(self.config.rpc_timeout, self.transport.send_vote_request(peer, req)).await {
                Ok(Ok(resp)) => {
                    votes.insert(peer, resp.vote_granted);
                }
                _ => {
                    votes.insert(peer, false);
                }
            }
        }

        let config = self.cluster_config.read().clone();
        config.has_joint_quorum(&votes)
    }

    async fn become_leader(&self, term: Term) {
        self.set_role(Role::Leader);
        *self.leader_id.write() = Some(self.config.id);

        let last_index = self.state.lock().last_index();
        let mut next_index = self.next_index.lock();
        let mut match_index = self.match_index.lock();
        next_index.clear();
        match_index.clear();
        for peer in self.peers() {
            next_index.insert(peer, last_index + 1);
            match_index.insert(peer, 0);
        }
        drop(next_index);
        drop(match_index);

        let mut state = self.state.lock();
        state.append(vec![LogEntry { term, index: state.last_index() + 1, kind: LogEntryKind::Noop, payload: Vec::new() }]);
        drop(state);

        self.replicate_once().await;
    }

    /// Send one round of AppendEntries to every peer, applying next_index
    /// back-off on rejection and advancing the commit index on success.
    pub async fn replicate_once(&self) {
        if self.role() != Role::Leader {
            return;
        }
        for peer in self.peers() {
            self.replicate_to_peer(peer).await;
        }
        self.advance_commit_index();
        self.drain_applicable().await;
    }

    async fn replicate_to_peer(&self, peer: RaftNodeId) {
        let (term, prev_log_index, prev_log_term, entries, leader_commit) = {
            let state = self.state.lock();
            let next = self.next_index.lock().get(&peer).copied().unwrap_or(state.last_index() + 1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
            let entries: Vec<LogEntry> = state.log.iter().filter(|e| e.index >= next).cloned().collect();
            (state.current_term, prev_log_index, prev_log_term, entries, self.commit_index.load(Ordering::Acquire))
        };

        let req = AppendEntriesRequest { term, leader_id: self.config.id, prev_log_index, prev_log_term, entries, leader_commit };
        let resp = match tokio::time::timeout(self.config.rpc_timeout, self.transport.send_append_entries(peer, req)).await {
            Ok(Ok(resp)) => resp,
            _ => return,
        };

        if resp.term > self.current_term() {
            self.maybe_step_down(resp.term);
            return;
        }

        if resp.success {
            if let Some(match_idx) = resp.match_index {
                self.match_index.lock().insert(peer, match_idx);
                self.next_index.lock().insert(peer, match_idx + 1);
            }
        } else {
            let mut next_index = self.next_index.lock();
            let back_off = match (resp.conflict_term, resp.conflict_index) {
                (Some(_), Some(conflict_index)) => conflict_index,
                (None, Some(conflict_index)) => conflict_index,
                _ => next_index.get(&peer).copied().unwrap_or(1).saturating_sub(1).max(1),
            };
            next_index.insert(peer, back_off.max(1));
        }
    }

    /// Advance `commit_index` to the highest `N` that a majority (honoring
    /// joint consensus) has replicated, never counting majorities from a
    /// prior term.
    fn advance_commit_index(&self) {
        let state = self.state.lock();
        let current_term = state.current_term;
        let config = self.cluster_config.read().clone();
        let match_index = self.match_index.lock().clone();
        let commit_index = self.commit_index.load(Ordering::Acquire);

        let mut new_commit = commit_index;
        for n in (commit_index + 1..=state.last_index()).rev() {
            if state.term_at(n) != Some(current_term) {
                continue;
            }
            let mut votes: HashMap<RaftNodeId, bool> = HashMap::new();
            votes.insert(self.config.id, true);
            for (&peer, &idx) in &match_index {
                votes.insert(peer, idx >= n);
            }
            if config.has_joint_quorum(&votes) {
                new_commit = n;
                break;
            }
        }
        drop(state);
        if new_commit > commit_index {
            self.commit_index.store(new_commit, Ordering::Release);
        }
    }

    pub fn apply_configuration(&self, config: ClusterConfiguration) {
        *self.cluster_config.write() = config;
    }

    /// Background driver: fires elections on timeout as a follower/candidate
    /// and heartbeats on interval as leader, until `shutdown` is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.role() {
                Role::Leader => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                            self.replicate_once().await;
                        }
                        _ = shutdown.changed() => return,
                    }
                }
                Role::Follower | Role::Candidate => {
                    let timeout = self.randomized_election_timeout();
                    tokio::select! {
                        _ = tokio::time::sleep(timeout) => {
                            let _ = self.run_election().await;
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }
}
