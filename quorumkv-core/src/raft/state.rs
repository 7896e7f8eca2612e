use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// The three states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// Term and vote
#[derive(Debug, Clone, Default)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

impl PersistentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_term(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
    }

    pub fn vote_for(&mut self, candidate_id: String) -> bool {
        if self.voted_for.is_none() {
            self.voted_for = Some(candidate_id);
            true
        } else {
            false
        }
    }

    pub fn already_voted_for(&self, candidate_id: &str) -> bool {
        self.voted_for.as_deref() == Some(candidate_id)
    }
}

/// Volatile state - can be reconstructed after crash
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    pub commit_index: u64,
    pub last_applied: u64,
}

impl VolatileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_commit_index(&mut self, new_index: u64) {
        if new_index > self.commit_index {
            self.commit_index = new_index;
        }
    }

    /// Marks every committed index as applied and returns them in order.
    pub fn apply_entries(&mut self) -> Vec<u64> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            applied.push(self.last_applied);
        }
        applied
    }
}

/// Volatile state on leaders - reinitialized after election
#[derive(Debug, Clone)]
pub struct LeaderState {
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
}

impl LeaderState {
    pub fn new(peers: &[String], last_log_index: u64) -> Self {
        let mut state = Self {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        for peer in peers {
            state.add_peer(peer, last_log_index);
        }
        state
    }

    /// Starts tracking a peer; existing progress is left alone.
    pub fn add_peer(&mut self, peer: &str, last_log_index: u64) {
        self.next_index
            .entry(peer.to_string())
            .or_insert(last_log_index + 1);
        self.match_index.entry(peer.to_string()).or_insert(0);
    }

    /// Stops tracking every peer not in `peers`.
    pub fn retain_peers(&mut self, peers: &[String]) {
        self.next_index.retain(|p, _| peers.contains(p));
        self.match_index.retain(|p, _| peers.contains(p));
    }

    /// Progress only moves forward; stale acknowledgements are ignored.
    pub fn update_peer_progress(&mut self, peer: &str, match_idx: u64) {
        if let Some(m) = self.match_index.get_mut(peer) {
            if match_idx > *m {
                *m = match_idx;
            }
        }
        if let Some(n) = self.next_index.get_mut(peer) {
            if match_idx + 1 > *n {
                *n = match_idx + 1;
            }
        }
    }

    /// Steps `next_index` back after a rejection, jumping straight past the
    /// follower's last index when that is further back.
    pub fn decrement_next_index(&mut self, peer: &str, follower_last_index: u64) {
        if let Some(n) = self.next_index.get_mut(peer) {
            let backed_off = n.saturating_sub(1).min(follower_last_index + 1);
            *n = backed_off.max(1);
        }
    }

    pub fn get_next_index(&self, peer: &str) -> u64 {
        self.next_index.get(peer).copied().unwrap_or(1)
    }

    pub fn get_match_index(&self, peer: &str) -> u64 {
        self.match_index.get(peer).copied().unwrap_or(0)
    }
}

/// Election timeout configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: 150,
            max_timeout_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

impl ElectionConfig {
    pub fn random_timeout(&self) -> Duration {
        let timeout = if self.max_timeout_ms > self.min_timeout_ms {
            rand::thread_rng().gen_range(self.min_timeout_ms..self.max_timeout_ms)
        } else {
            self.min_timeout_ms
        };
        Duration::from_millis(timeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Tracks election timing
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    pub last_reset: Instant,
    pub timeout: Duration,
    pub config: ElectionConfig,
}

impl ElectionTimer {
    pub fn new(config: ElectionConfig) -> Self {
        let timeout = config.random_timeout();
        Self {
            last_reset: Instant::now(),
            timeout,
            config,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.last_reset.elapsed() >= self.timeout
    }

    pub fn reset(&mut self) {
        self.last_reset = Instant::now();
        self.timeout = self.config.random_timeout();
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.last_reset.elapsed())
    }
}
