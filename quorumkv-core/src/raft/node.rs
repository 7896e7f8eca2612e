use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::ProposeError;
use crate::raft::log::{EntryPayload, LogEntry, RaftLog};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::raft::state::{
    ElectionConfig, ElectionTimer, LeaderState, NodeState, PersistentState, VolatileState,
};
use crate::raft::wal::HardState;

/// Upper bound on entries shipped in a single AppendEntries.
pub const DEFAULT_MAX_APPEND_ENTRIES: usize = 64;

/// What the leader should send a peer next.
#[derive(Debug, Clone)]
pub enum Replication {
    Append(AppendEntriesRequest),
    /// The peer needs entries that were compacted away. The caller attaches
    /// the snapshot itself.
    Snapshot { term: u64, leader_id: String },
}

/// How a follower should proceed with an InstallSnapshot request.
#[derive(Debug, Clone)]
pub enum SnapshotDecision {
    Reject(InstallSnapshotResponse),
    /// Already applied past the snapshot; nothing to install.
    UpToDate(InstallSnapshotResponse),
    Install,
}

/// The main Raft node implementation
#[derive(Debug)]
pub struct RaftNode {
    pub id: String,
    pub peers: Vec<String>,
    pub state: NodeState,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    pub log: RaftLog,
    pub leader_state: Option<LeaderState>,
    pub current_leader: Option<String>,
    pub election_timer: ElectionTimer,
    pub votes_received: HashSet<String>,
    pub single_node: bool,
    pub max_append_entries: usize,
    /// Voter set as of the snapshot boundary.
    base_members: Vec<String>,
}

impl RaftNode {
    /// Create a new Raft node
    pub fn new(id: String, peers: Vec<String>) -> Self {
        Self::with_config(id, peers, ElectionConfig::default())
    }

    /// Create with custom election config
    pub fn with_config(id: String, peers: Vec<String>, config: ElectionConfig) -> Self {
        let mut node = Self {
            id,
            peers: Vec::new(),
            state: NodeState::Follower,
            persistent: PersistentState::new(),
            volatile: VolatileState::new(),
            log: RaftLog::new(),
            leader_state: None,
            current_leader: None,
            election_timer: ElectionTimer::new(config),
            votes_received: HashSet::new(),
            single_node: false,
            max_append_entries: DEFAULT_MAX_APPEND_ENTRIES,
            base_members: Vec::new(),
        };
        let mut members = vec![node.id.clone()];
        members.extend(peers);
        node.set_members(&members);
        node.base_members = node.members();
        node
    }

    /// Allow this node to elect itself when it has no peers.
    pub fn enable_single_node(&mut self) {
        self.single_node = true;
    }

    // ==================== State Queries ====================

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.state == NodeState::Candidate
    }

    pub fn is_follower(&self) -> bool {
        self.state == NodeState::Follower
    }

    pub fn current_term(&self) -> u64 {
        self.persistent.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.volatile.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.volatile.last_applied
    }

    /// Term and vote as they must be stored.
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.persistent.current_term,
            voted_for: self.persistent.voted_for.clone(),
        }
    }

    pub fn leader(&self) -> Option<&str> {
        self.current_leader.as_deref()
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum_size(&self) -> usize {
        (self.cluster_size() / 2) + 1
    }

    /// Full voter set, this node first.
    pub fn members(&self) -> Vec<String> {
        let mut members = Vec::with_capacity(self.cluster_size());
        members.push(self.id.clone());
        members.extend(self.peers.iter().cloned());
        members
    }

    /// Whether an `add_peer` should first make this node leader on its own.
    pub fn can_bootstrap(&self) -> bool {
        self.single_node && self.peers.is_empty() && !self.is_leader()
    }

    // ==================== State Transitions ====================

    pub fn become_follower(&mut self, term: u64) {
        if term > self.persistent.current_term {
            self.current_leader = None;
        }
        self.state = NodeState::Follower;
        self.persistent.update_term(term);
        self.leader_state = None;
        self.votes_received.clear();
        self.election_timer.reset();
    }

    pub fn start_election(&mut self) {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id.clone());

        self.state = NodeState::Candidate;
        self.leader_state = None;
        self.current_leader = None;

        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        self.election_timer.reset();

        debug!(
            node = %self.id,
            term = self.persistent.current_term,
            "starting election"
        );

        // A single-voter cluster needs nobody else.
        if self.votes_received.len() >= self.quorum_size() {
            self.become_leader();
        }
    }

    /// Get RequestVote request to send to peers
    pub fn create_request_vote(&self) -> RequestVoteRequest {
        RequestVoteRequest::new(
            self.persistent.current_term,
            self.id.clone(),
            self.log.last_index(),
            self.log.last_term(),
        )
    }

    /// Transition to leader state
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.current_leader = Some(self.id.clone());
        self.leader_state = Some(LeaderState::new(&self.peers, self.log.last_index()));
        self.votes_received.clear();

        info!(
            node = %self.id,
            term = self.persistent.current_term,
            "elected leader"
        );

        // Entries from earlier terms only commit behind one from this term.
        self.log.append(self.persistent.current_term, EntryPayload::Noop);
        self.try_advance_commit_index();
    }

    /// Become leader straight away if this is a lone single-node member.
    pub fn bootstrap(&mut self) -> bool {
        if self.can_bootstrap() {
            self.start_election();
        }
        self.is_leader()
    }

    // ==================== Election Handling ====================

    pub fn should_start_election(&self) -> bool {
        self.state != NodeState::Leader
            && self.election_timer.is_expired()
            && (!self.peers.is_empty() || self.single_node)
    }

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, request: &RequestVoteRequest) -> RequestVoteResponse {
        // Rule 1: Reply false if term < currentTerm
        if request.term < self.persistent.current_term {
            return RequestVoteResponse::denied(self.persistent.current_term, self.id.clone());
        }

        // Rule 2: If term > currentTerm, update term and become follower
        if request.term > self.persistent.current_term {
            self.become_follower(request.term);
        }

        // Rule 3: Check if we can vote for this candidate
        let can_vote = match &self.persistent.voted_for {
            None => true,
            Some(voted_for) => voted_for == &request.candidate_id,
        };

        // Rule 4: Check if candidate's log is at least as up-to-date
        let log_ok = self
            .log
            .is_up_to_date(request.last_log_term, request.last_log_index);

        if can_vote && log_ok {
            self.persistent.voted_for = Some(request.candidate_id.clone());
            self.election_timer.reset();

            RequestVoteResponse::granted(self.persistent.current_term, self.id.clone())
        } else {
            RequestVoteResponse::denied(self.persistent.current_term, self.id.clone())
        }
    }

    /// Handle RequestVote response (as candidate). Returns true if this
    /// response won the election.
    pub fn handle_request_vote_response(&mut self, response: &RequestVoteResponse) -> bool {
        if response.term > self.persistent.current_term {
            self.become_follower(response.term);
            return false;
        }

        if self.state != NodeState::Candidate {
            return false;
        }

        if response.term != self.persistent.current_term {
            return false;
        }

        if response.vote_granted && self.peers.contains(&response.voter_id) {
            self.votes_received.insert(response.voter_id.clone());

            if self.votes_received.len() >= self.quorum_size() {
                self.become_leader();
                return true;
            }
        }

        false
    }

    // ==================== Membership ====================

    fn set_members(&mut self, members: &[String]) {
        let mut peers: Vec<String> = Vec::new();
        for member in members {
            if *member != self.id && !peers.contains(member) {
                peers.push(member.clone());
            }
        }
        self.peers = peers;

        let last_index = self.log.last_index();
        if let Some(leader_state) = self.leader_state.as_mut() {
            for peer in &self.peers {
                leader_state.add_peer(peer, last_index);
            }
            leader_state.retain_peers(&self.peers);
        }
    }

    /// Recomputes the voter set from the newest membership entry in the log.
    fn refresh_membership(&mut self) {
        let members = self.membership_at(self.log.last_index());
        self.set_members(&members);
    }

    /// Voter set in effect at `index`.
    pub fn membership_at(&self, index: u64) -> Vec<String> {
        self.log
            .entries()
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.payload {
                EntryPayload::Membership(members) => Some(members.clone()),
                _ => None,
            })
            .unwrap_or_else(|| self.base_members.clone())
    }

    fn has_uncommitted_membership(&self) -> bool {
        self.log
            .get_from(self.volatile.commit_index + 1)
            .iter()
            .any(|e| matches!(e.payload, EntryPayload::Membership(_)))
    }

    // ==================== Proposals ====================

    /// Append a command to the leader's log. Returns its index and term.
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(u64, u64), ProposeError> {
        if self.state != NodeState::Leader {
            return Err(ProposeError::NotLeader {
                leader: self.current_leader.clone(),
            });
        }

        let term = self.persistent.current_term;
        let index = self.log.append(term, EntryPayload::Command(command));
        self.try_advance_commit_index();
        Ok((index, term))
    }

    /// Append a membership entry adding `addr` to the voter set.
    ///
    /// Returns `None` if `addr` is already a member. The new configuration
    /// takes effect immediately; it commits once a majority of the new set
    /// has it.
    pub fn propose_add_peer(&mut self, addr: &str) -> Result<Option<(u64, u64)>, ProposeError> {
        if self.state != NodeState::Leader {
            return Err(ProposeError::NotLeader {
                leader: self.current_leader.clone(),
            });
        }

        if addr == self.id || self.peers.iter().any(|p| p == addr) {
            return Ok(None);
        }

        if self.has_uncommitted_membership() {
            return Err(ProposeError::ConfigChangeInProgress);
        }

        let mut members = self.members();
        members.push(addr.to_string());

        let term = self.persistent.current_term;
        let index = self
            .log
            .append(term, EntryPayload::Membership(members.clone()));
        self.set_members(&members);
        self.try_advance_commit_index();

        info!(node = %self.id, peer = addr, index, "proposed adding peer");
        Ok(Some((index, term)))
    }

    // ==================== Log Replication ====================

    /// Create AppendEntries request for a peer (as leader). Returns `None`
    /// if the peer needs a snapshot instead.
    pub fn create_append_entries(&self, peer: &str) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader {
            return None;
        }

        let leader_state = self.leader_state.as_ref()?;
        let next_index = leader_state.get_next_index(peer);
        if next_index <= self.log.snapshot_index() {
            return None;
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?;

        let max = self.max_append_entries.max(1) as u64;
        let entries = self.log.get_range(next_index, next_index + max - 1);

        Some(AppendEntriesRequest::with_entries(
            self.persistent.current_term,
            self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            self.volatile.commit_index,
        ))
    }

    pub fn create_replication(&self, peer: &str) -> Option<Replication> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next_index = self.leader_state.as_ref()?.get_next_index(peer);
        if next_index <= self.log.snapshot_index() {
            return Some(Replication::Snapshot {
                term: self.persistent.current_term,
                leader_id: self.id.clone(),
            });
        }
        self.create_append_entries(peer).map(Replication::Append)
    }

    /// Next message for every peer
    pub fn create_replications(&self) -> Vec<(String, Replication)> {
        if self.state != NodeState::Leader {
            return Vec::new();
        }

        self.peers
            .iter()
            .filter_map(|peer| self.create_replication(peer).map(|r| (peer.clone(), r)))
            .collect()
    }

    /// Handle AppendEntries RPC (as follower)
    pub fn handle_append_entries(&mut self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        // Rule 1: Reply false if term < currentTerm
        if request.term < self.persistent.current_term {
            return AppendEntriesResponse::failure(
                self.persistent.current_term,
                self.id.clone(),
                self.log.last_index(),
            );
        }

        if request.term > self.persistent.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term);
        } else {
            self.election_timer.reset();
        }
        self.current_leader = Some(request.leader_id.clone());

        // Rule 2 & 3: Check log consistency and append entries
        let success = self.log.handle_append_entries(
            request.prev_log_index,
            request.prev_log_term,
            request.entries.clone(),
        );

        if !success {
            return AppendEntriesResponse::failure(
                self.persistent.current_term,
                self.id.clone(),
                self.log.last_index(),
            );
        }

        if !request.entries.is_empty() {
            self.refresh_membership();
        }

        let match_index = request.prev_log_index + request.entries.len() as u64;

        // Rule 4: Update commit index
        if request.leader_commit > self.volatile.commit_index {
            self.volatile
                .update_commit_index(request.leader_commit.min(match_index));
        }

        AppendEntriesResponse::success(self.persistent.current_term, self.id.clone(), match_index)
    }

    /// Handle AppendEntries response (as leader)
    pub fn handle_append_entries_response(&mut self, response: &AppendEntriesResponse) {
        if response.term > self.persistent.current_term {
            self.become_follower(response.term);
            return;
        }

        if self.state != NodeState::Leader || response.term < self.persistent.current_term {
            return;
        }

        let leader_state = match self.leader_state.as_mut() {
            Some(ls) => ls,
            None => return,
        };

        if response.success {
            leader_state.update_peer_progress(&response.follower_id, response.match_index);
            self.try_advance_commit_index();
        } else {
            leader_state.decrement_next_index(&response.follower_id, response.match_index);
        }
    }

    /// Try to advance commit index based on replication progress
    fn try_advance_commit_index(&mut self) {
        if self.state != NodeState::Leader {
            return;
        }

        let leader_state = match self.leader_state.as_ref() {
            Some(ls) => ls,
            None => return,
        };

        let mut match_indices: Vec<u64> = self
            .peers
            .iter()
            .map(|p| leader_state.get_match_index(p))
            .collect();
        match_indices.push(self.log.last_index());
        match_indices.sort_unstable();

        let majority_idx = match_indices.len() - self.quorum_size();
        let potential_commit = match_indices[majority_idx];

        if potential_commit > self.volatile.commit_index {
            if let Some(term) = self.log.term_at(potential_commit) {
                if term == self.persistent.current_term {
                    self.volatile.commit_index = potential_commit;
                }
            }
        }
    }

    // ==================== Snapshots ====================

    /// Handle InstallSnapshot RPC (as follower). On `Install` the caller
    /// restores the state machine and then calls
    /// [`complete_install_snapshot`](Self::complete_install_snapshot).
    pub fn handle_install_snapshot(&mut self, request: &InstallSnapshotRequest) -> SnapshotDecision {
        if request.term < self.persistent.current_term {
            return SnapshotDecision::Reject(InstallSnapshotResponse::failure(
                self.persistent.current_term,
                self.id.clone(),
            ));
        }

        if request.term > self.persistent.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term);
        } else {
            self.election_timer.reset();
        }
        self.current_leader = Some(request.leader_id.clone());

        if request.last_included_index <= self.volatile.last_applied {
            return SnapshotDecision::UpToDate(InstallSnapshotResponse::success(
                self.persistent.current_term,
                self.id.clone(),
                request.last_included_index,
            ));
        }

        SnapshotDecision::Install
    }

    /// Bring the log in line with a snapshot that has just been restored
    /// into the state machine.
    pub fn complete_install_snapshot(
        &mut self,
        index: u64,
        term: u64,
        members: Vec<String>,
    ) -> InstallSnapshotResponse {
        if self.log.term_at(index) == Some(term) {
            self.log.compact_to(index, term);
        } else {
            self.log.reset_to_snapshot(index, term);
        }
        self.base_members = members;
        self.refresh_membership();

        self.volatile.update_commit_index(index);
        self.volatile.last_applied = index;

        info!(node = %self.id, index, term, "installed snapshot");
        InstallSnapshotResponse::success(self.persistent.current_term, self.id.clone(), index)
    }

    /// Handle InstallSnapshot response (as leader)
    pub fn handle_install_snapshot_response(&mut self, response: &InstallSnapshotResponse) {
        if response.term > self.persistent.current_term {
            self.become_follower(response.term);
            return;
        }

        if self.state != NodeState::Leader || !response.success {
            return;
        }

        if let Some(leader_state) = self.leader_state.as_mut() {
            leader_state.update_peer_progress(&response.follower_id, response.match_index);
        }
        self.try_advance_commit_index();
    }

    /// Whether enough has been applied since the last snapshot to take
    /// another one.
    pub fn should_snapshot(&self, threshold: u64) -> bool {
        threshold > 0
            && self.volatile.last_applied.saturating_sub(self.log.snapshot_index()) >= threshold
    }

    /// Index and term of the last applied entry, if anything was applied.
    pub fn snapshot_point(&self) -> Option<(u64, u64)> {
        let index = self.volatile.last_applied;
        if index == 0 {
            return None;
        }
        self.log.term_at(index).map(|term| (index, term))
    }

    /// Drop log entries covered by a snapshot taken at (`index`, `term`).
    pub fn compact(&mut self, index: u64, term: u64, members: Vec<String>) {
        if index <= self.log.snapshot_index() || index > self.volatile.last_applied {
            return;
        }
        self.log.compact_to(index, term);
        self.base_members = members;
        debug!(
            node = %self.id,
            index,
            remaining = self.log.len(),
            "compacted log"
        );
    }

    /// Start from a snapshot found on disk. Members already known to this
    /// node are kept.
    pub fn restore_snapshot(&mut self, index: u64, term: u64, members: Vec<String>) {
        let mut all = members;
        for member in self.members() {
            if !all.contains(&member) {
                all.push(member);
            }
        }

        self.log.reset_to_snapshot(index, term);
        self.base_members = all;
        self.refresh_membership();
        self.persistent.update_term(term);
        self.volatile.update_commit_index(index);
        self.volatile.last_applied = index;
    }

    /// Take back the term, vote and log entries read from the write-ahead
    /// log. Runs after any snapshot restore; entries the snapshot already
    /// covers are skipped. Returns how many entries were restored.
    pub fn recover(&mut self, hard_state: HardState, log: &RaftLog) -> usize {
        if hard_state.current_term >= self.persistent.current_term {
            self.persistent.current_term = hard_state.current_term;
            self.persistent.voted_for = hard_state.voted_for;
        }

        let mut restored = 0;
        for entry in log.get_from(self.log.last_index() + 1) {
            if entry.index != self.log.last_index() + 1 {
                break;
            }
            self.log.append(entry.term, entry.payload);
            restored += 1;
        }
        self.refresh_membership();
        restored
    }

    // ==================== State Machine Application ====================

    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let indices = self.volatile.apply_entries();

        indices
            .iter()
            .filter_map(|&idx| self.log.get(idx).cloned())
            .collect()
    }

    pub fn has_entries_to_apply(&self) -> bool {
        self.volatile.last_applied < self.volatile.commit_index
    }
}
