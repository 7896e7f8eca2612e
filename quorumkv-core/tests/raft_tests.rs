use std::time::Duration;

use quorumkv_core::raft::state::{
    NodeState, PersistentState, VolatileState, LeaderState, ElectionConfig, ElectionTimer
};
use quorumkv_core::raft::log::{RaftLog, LogEntry, EntryPayload};
use quorumkv_core::raft::message::{
    RequestVoteRequest, RequestVoteResponse,
    AppendEntriesRequest, AppendEntriesResponse,
    InstallSnapshotRequest, InstallSnapshotResponse,
};
use quorumkv_core::raft::node::{RaftNode, Replication, SnapshotDecision};
use quorumkv_core::raft::wal::HardState;
use quorumkv_core::ProposeError;

fn cmd(bytes: &str) -> EntryPayload {
    EntryPayload::Command(bytes.as_bytes().to_vec())
}

// ==================== State Tests ====================

mod state_tests {
    use super::*;

    #[test]
    fn test_node_state_default() {
        assert_eq!(NodeState::default(), NodeState::Follower);
    }

    #[test]
    fn test_persistent_state_update_term() {
        let mut state = PersistentState::new();
        state.current_term = 5;
        state.voted_for = Some("node1".to_string());

        // Higher term should clear vote
        state.update_term(6);
        assert_eq!(state.current_term, 6);
        assert_eq!(state.voted_for, None);

        // Lower term should not update
        state.current_term = 10;
        state.voted_for = Some("node2".to_string());
        state.update_term(5);
        assert_eq!(state.current_term, 10);
        assert_eq!(state.voted_for, Some("node2".to_string()));
    }

    #[test]
    fn test_vote_for() {
        let mut state = PersistentState::new();

        assert!(state.vote_for("node1".to_string()));
        assert_eq!(state.voted_for, Some("node1".to_string()));

        assert!(!state.vote_for("node2".to_string()));
        assert!(state.already_voted_for("node1"));
    }

    #[test]
    fn test_volatile_state_apply_entries() {
        let mut state = VolatileState::new();
        state.commit_index = 5;

        let applied = state.apply_entries();
        assert_eq!(applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(state.last_applied, 5);

        let applied2 = state.apply_entries();
        assert!(applied2.is_empty());
    }

    #[test]
    fn test_commit_index_never_decreases() {
        let mut state = VolatileState::new();
        state.update_commit_index(7);
        state.update_commit_index(3);
        assert_eq!(state.commit_index, 7);
    }

    #[test]
    fn test_leader_state_peer_progress() {
        let peers = vec!["peer1".to_string(), "peer2".to_string()];
        let mut leader = LeaderState::new(&peers, 10);

        assert_eq!(leader.get_next_index("peer1"), 11);
        assert_eq!(leader.get_match_index("peer1"), 0);

        leader.update_peer_progress("peer1", 8);
        assert_eq!(leader.get_next_index("peer1"), 11);
        assert_eq!(leader.get_match_index("peer1"), 8);

        // A late, smaller acknowledgement changes nothing
        leader.update_peer_progress("peer1", 5);
        assert_eq!(leader.get_match_index("peer1"), 8);

        leader.update_peer_progress("peer1", 12);
        assert_eq!(leader.get_next_index("peer1"), 13);

        // Decrement after failed append
        leader.decrement_next_index("peer2", 100);
        assert_eq!(leader.get_next_index("peer2"), 10);

        // A short follower log lets the leader jump back
        leader.decrement_next_index("peer2", 3);
        assert_eq!(leader.get_next_index("peer2"), 4);
    }

    #[test]
    fn test_leader_state_membership() {
        let mut leader = LeaderState::new(&["peer1".to_string()], 4);
        leader.update_peer_progress("peer1", 4);

        leader.add_peer("peer1", 9);
        leader.add_peer("peer2", 9);
        assert_eq!(leader.get_match_index("peer1"), 4);
        assert_eq!(leader.get_next_index("peer2"), 10);

        leader.retain_peers(&["peer2".to_string()]);
        assert!(!leader.next_index.contains_key("peer1"));
    }

    #[test]
    fn test_election_timer() {
        let config = ElectionConfig {
            min_timeout_ms: 100,
            max_timeout_ms: 200,
            heartbeat_interval_ms: 50,
        };

        let timer = ElectionTimer::new(config);
        assert!(!timer.is_expired());
        assert!(timer.timeout.as_millis() >= 100);
        assert!(timer.timeout.as_millis() < 200);
    }
}

// ==================== Log Tests ====================

mod log_tests {
    use super::*;

    #[test]
    fn test_log_append() {
        let mut log = RaftLog::new();

        let idx1 = log.append(1, cmd("a"));
        assert_eq!(idx1, 1);
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);

        let idx2 = log.append(1, cmd("b"));
        assert_eq!(idx2, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_log_get() {
        let mut log = RaftLog::new();
        log.append(1, cmd("a"));
        log.append(2, cmd("b"));

        assert!(log.get(0).is_none());
        assert_eq!(log.get(1).unwrap().term, 1);
        assert_eq!(log.get(2).unwrap().payload, cmd("b"));
        assert!(log.get(3).is_none());
    }

    #[test]
    fn test_log_term_at() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(2, EntryPayload::Noop);
        log.append(2, EntryPayload::Noop);

        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), Some(1));
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(4), None);
    }

    #[test]
    fn test_log_matches() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(2, EntryPayload::Noop);

        assert!(log.matches(0, 0));
        assert!(log.matches(1, 1));
        assert!(log.matches(2, 2));

        assert!(!log.matches(1, 2)); // Wrong term
        assert!(!log.matches(3, 2)); // Index doesn't exist
    }

    #[test]
    fn test_log_is_up_to_date() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(2, EntryPayload::Noop);

        assert!(log.is_up_to_date(3, 1));
        assert!(log.is_up_to_date(2, 3));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 5));
    }

    #[test]
    fn test_log_truncate() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(2, EntryPayload::Noop);
        log.append(3, EntryPayload::Noop);

        log.truncate_after(1);

        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_get_range_is_inclusive() {
        let mut log = RaftLog::new();
        for i in 0..5 {
            log.append(1, cmd(&i.to_string()));
        }

        let range = log.get_range(2, 4);
        let indexes: Vec<u64> = range.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![2, 3, 4]);

        assert_eq!(log.get_range(4, 100).len(), 2);
        assert!(log.get_range(6, 10).is_empty());
        assert_eq!(log.get_from(1).len(), 5);
    }

    #[test]
    fn test_handle_append_entries() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(1, EntryPayload::Noop);

        let new_entries = vec![LogEntry::new(2, 3, cmd("k"))];

        assert!(log.handle_append_entries(2, 1, new_entries));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_handle_append_entries_conflict() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(1, EntryPayload::Noop);
        log.append(1, EntryPayload::Noop);

        // Leader sends entry at index 2 with different term
        let new_entries = vec![LogEntry::new(2, 2, cmd("k"))];

        assert!(log.handle_append_entries(1, 1, new_entries));
        assert_eq!(log.get(2).unwrap().term, 2);
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_handle_append_entries_is_idempotent() {
        let mut log = RaftLog::new();
        let entries = vec![LogEntry::new(1, 1, cmd("a")), LogEntry::new(1, 2, cmd("b"))];

        assert!(log.handle_append_entries(0, 0, entries.clone()));
        assert!(log.handle_append_entries(0, 0, entries));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_handle_append_entries_fails_consistency() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);

        let new_entries = vec![LogEntry::new(2, 2, EntryPayload::Noop)];

        assert!(!log.handle_append_entries(1, 2, new_entries));
    }

    #[test]
    fn test_compaction_keeps_boundary() {
        let mut log = RaftLog::new();
        for _ in 0..5 {
            log.append(1, EntryPayload::Noop);
        }
        log.append(2, EntryPayload::Noop);

        log.compact_to(4, 1);

        assert_eq!(log.snapshot_index(), 4);
        assert_eq!(log.snapshot_term(), 1);
        assert_eq!(log.first_index(), 5);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last_index(), 6);
        assert_eq!(log.last_term(), 2);

        assert!(log.get(4).is_none());
        assert_eq!(log.term_at(4), Some(1));
        assert_eq!(log.term_at(3), None);
        assert_eq!(log.get(5).unwrap().index, 5);
        assert_eq!(log.get_from(1).len(), 2);
    }

    #[test]
    fn test_compacted_log_accepts_appends() {
        let mut log = RaftLog::new();
        for _ in 0..3 {
            log.append(1, EntryPayload::Noop);
        }
        log.compact_to(3, 1);

        assert!(log.handle_append_entries(3, 1, vec![LogEntry::new(1, 4, cmd("x"))]));
        assert_eq!(log.last_index(), 4);

        // Entries already covered by the snapshot are skipped
        let overlapping = vec![
            LogEntry::new(1, 2, EntryPayload::Noop),
            LogEntry::new(1, 3, EntryPayload::Noop),
            LogEntry::new(1, 4, cmd("x")),
            LogEntry::new(1, 5, cmd("y")),
        ];
        assert!(log.handle_append_entries(1, 1, overlapping));
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_truncate_stops_at_snapshot() {
        let mut log = RaftLog::new();
        for _ in 0..4 {
            log.append(1, EntryPayload::Noop);
        }
        log.compact_to(2, 1);

        log.truncate_after(0);

        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_reset_to_snapshot() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);

        log.reset_to_snapshot(10, 3);

        assert!(log.is_empty());
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);
        assert_eq!(log.append(4, EntryPayload::Noop), 11);
    }
}

// ==================== Message Tests ====================

mod message_tests {
    use super::*;

    #[test]
    fn test_request_vote_request() {
        let req = RequestVoteRequest::new(5, "node1".to_string(), 10, 4);
        assert_eq!(req.term, 5);
        assert_eq!(req.candidate_id, "node1");
        assert_eq!(req.last_log_index, 10);
        assert_eq!(req.last_log_term, 4);
    }

    #[test]
    fn test_request_vote_response() {
        let granted = RequestVoteResponse::granted(5, "voter1".to_string());
        assert!(granted.vote_granted);

        let denied = RequestVoteResponse::denied(6, "voter2".to_string());
        assert!(!denied.vote_granted);
        assert_eq!(denied.term, 6);
    }

    #[test]
    fn test_append_entries_heartbeat() {
        let hb = AppendEntriesRequest::heartbeat(5, "leader".to_string(), 10, 4, 8);
        assert!(hb.is_heartbeat());
        assert!(hb.entries.is_empty());
    }

    #[test]
    fn test_append_entries_with_entries() {
        let entries = vec![LogEntry::new(5, 11, cmd("k"))];

        let req = AppendEntriesRequest::with_entries(5, "leader".to_string(), 10, 4, entries, 8);

        assert!(!req.is_heartbeat());
        assert_eq!(req.entries.len(), 1);
    }

    #[test]
    fn test_append_entries_response() {
        let success = AppendEntriesResponse::success(5, "follower1".to_string(), 15);
        assert!(success.success);
        assert_eq!(success.match_index, 15);

        let failure = AppendEntriesResponse::failure(5, "follower2".to_string(), 10);
        assert!(!failure.success);
    }

    #[test]
    fn test_install_snapshot_response() {
        let ok = InstallSnapshotResponse::success(2, "f".to_string(), 40);
        assert!(ok.success);
        assert_eq!(ok.match_index, 40);

        let rejected = InstallSnapshotResponse::failure(3, "f".to_string());
        assert!(!rejected.success);
        assert_eq!(rejected.term, 3);
    }
}

// ==================== Node Tests ====================

mod node_tests {
    use super::*;

    fn create_cluster() -> (RaftNode, RaftNode, RaftNode) {
        let node1 = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);
        let node2 = RaftNode::new("node2".to_string(), vec!["node1".to_string(), "node3".to_string()]);
        let node3 = RaftNode::new("node3".to_string(), vec!["node1".to_string(), "node2".to_string()]);
        (node1, node2, node3)
    }

    /// Elects `node` with one extra vote from `voter`.
    fn elect(node: &mut RaftNode, voter: &str) {
        node.start_election();
        let vote = RequestVoteResponse::granted(node.current_term(), voter.to_string());
        assert!(node.handle_request_vote_response(&vote));
    }

    fn single_node_leader(id: &str) -> RaftNode {
        let mut node = RaftNode::new(id.to_string(), Vec::new());
        node.enable_single_node();
        assert!(node.bootstrap());
        node
    }

    /// Ships entries from `leader` to `follower` until the follower has
    /// caught up, following snapshot hand-offs in memory.
    fn replicate(leader: &mut RaftNode, follower: &mut RaftNode) {
        for _ in 0..10 {
            match leader.create_replication(&follower.id).unwrap() {
                Replication::Append(request) => {
                    let response = follower.handle_append_entries(&request);
                    leader.handle_append_entries_response(&response);
                    if response.success && response.match_index == leader.log.last_index() {
                        return;
                    }
                }
                Replication::Snapshot { term, leader_id } => {
                    let (index, snap_term) = (leader.log.snapshot_index(), leader.log.snapshot_term());
                    let request = InstallSnapshotRequest {
                        term,
                        leader_id,
                        last_included_index: index,
                        last_included_term: snap_term,
                        members: leader.membership_at(index),
                        data: Vec::new(),
                    };
                    let response = match follower.handle_install_snapshot(&request) {
                        SnapshotDecision::Install => {
                            follower.complete_install_snapshot(index, snap_term, request.members.clone())
                        }
                        SnapshotDecision::UpToDate(r) | SnapshotDecision::Reject(r) => r,
                    };
                    leader.handle_install_snapshot_response(&response);
                }
            }
        }
        panic!("follower did not catch up");
    }

    #[test]
    fn test_node_creation() {
        let node = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);

        assert_eq!(node.id, "node1");
        assert_eq!(node.peers.len(), 2);
        assert!(node.is_follower());
        assert_eq!(node.current_term(), 0);
        assert_eq!(node.cluster_size(), 3);
        assert_eq!(node.quorum_size(), 2);
        assert_eq!(node.members(), vec!["node1", "node2", "node3"]);
    }

    #[test]
    fn test_node_creation_ignores_self_and_duplicates() {
        let node = RaftNode::new(
            "node1".to_string(),
            vec!["node1".to_string(), "node2".to_string(), "node2".to_string()],
        );
        assert_eq!(node.peers, vec!["node2".to_string()]);
    }

    #[test]
    fn test_start_election() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);

        node.start_election();

        assert!(node.is_candidate());
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.persistent.voted_for, Some("node1".to_string()));
        assert!(node.votes_received.contains("node1"));
    }

    #[test]
    fn test_become_leader_with_majority() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);

        node.start_election();
        assert!(node.is_candidate());

        let vote_response = RequestVoteResponse::granted(1, "node2".to_string());
        let became_leader = node.handle_request_vote_response(&vote_response);

        assert!(became_leader);
        assert!(node.is_leader());
        assert!(node.leader_state.is_some());
        assert_eq!(node.log.get(1).unwrap().payload, EntryPayload::Noop);
    }

    #[test]
    fn test_votes_from_strangers_do_not_count() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);
        node.start_election();

        let vote = RequestVoteResponse::granted(1, "intruder".to_string());
        assert!(!node.handle_request_vote_response(&vote));
        assert!(node.is_candidate());
    }

    #[test]
    fn test_request_vote_higher_term_becomes_follower() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        node.start_election();

        let request = RequestVoteRequest::new(5, "node2".to_string(), 0, 0);
        let response = node.handle_request_vote(&request);

        assert!(node.is_follower());
        assert_eq!(node.current_term(), 5);
        assert!(response.vote_granted);
    }

    #[test]
    fn test_request_vote_older_log_rejected() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);

        node.log.append(1, EntryPayload::Noop);
        node.log.append(2, EntryPayload::Noop);

        let request = RequestVoteRequest::new(3, "node2".to_string(), 1, 1);
        let response = node.handle_request_vote(&request);

        assert!(!response.vote_granted);
    }

    #[test]
    fn test_no_election_without_peers() {
        let mut node = RaftNode::new("node1".to_string(), Vec::new());
        node.election_timer.timeout = Duration::ZERO;
        assert!(!node.should_start_election());

        node.enable_single_node();
        assert!(node.should_start_election());
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut node = RaftNode::new("solo".to_string(), Vec::new());
        node.enable_single_node();

        node.start_election();

        assert!(node.is_leader());
        assert_eq!(node.leader(), Some("solo"));
        // The leader's no-op commits on its own
        assert_eq!(node.commit_index(), 1);
    }

    #[test]
    fn test_bootstrap_only_when_alone() {
        let mut node = RaftNode::new("node1".to_string(), Vec::new());
        assert!(!node.can_bootstrap());
        assert!(!node.bootstrap());

        node.enable_single_node();
        assert!(node.can_bootstrap());
        assert!(node.bootstrap());
        assert!(!node.can_bootstrap());

        let mut clustered = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        clustered.enable_single_node();
        assert!(!clustered.can_bootstrap());
    }

    #[test]
    fn test_propose_on_follower_reports_leader() {
        let (_, mut node2, _) = create_cluster();
        node2.current_leader = Some("node1".to_string());

        let err = node2.propose(b"x".to_vec()).unwrap_err();
        assert_eq!(err, ProposeError::NotLeader { leader: Some("node1".to_string()) });
    }

    #[test]
    fn test_single_node_propose_commits_immediately() {
        let mut node = single_node_leader("solo");

        let (index, term) = node.propose(b"payload".to_vec()).unwrap();

        assert_eq!(index, 2);
        assert_eq!(term, 1);
        assert_eq!(node.commit_index(), 2);

        let entries = node.get_entries_to_apply();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].payload, cmd("payload"));
    }

    #[test]
    fn test_append_entries_heartbeat() {
        let (mut node1, mut node2, _) = create_cluster();
        elect(&mut node1, "node3");

        let heartbeat = node1.create_append_entries("node2").unwrap();
        let response = node2.handle_append_entries(&heartbeat);

        assert!(response.success);
        assert_eq!(node2.current_leader, Some("node1".to_string()));
    }

    #[test]
    fn test_append_entries_with_log() {
        let (mut node1, mut node2, _) = create_cluster();
        elect(&mut node1, "node3");

        node1.propose(b"set".to_vec()).unwrap();

        let request = node1.create_append_entries("node2").unwrap();
        let response = node2.handle_append_entries(&request);

        assert!(response.success);
        assert_eq!(response.match_index, 2);
        assert_eq!(node2.log.last_index(), node1.log.last_index());
    }

    #[test]
    fn test_append_entries_respects_batch_limit() {
        let (mut node1, mut node2, _) = create_cluster();
        elect(&mut node1, "node3");
        node1.max_append_entries = 2;
        for i in 0..5 {
            node1.propose(vec![i]).unwrap();
        }

        let request = node1.create_append_entries("node2").unwrap();
        assert_eq!(request.entries.len(), 2);

        replicate(&mut node1, &mut node2);
        assert_eq!(node2.log.last_index(), 6);
    }

    #[test]
    fn test_append_entries_stale_term_rejected() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        node.persistent.current_term = 5;

        let request = AppendEntriesRequest::heartbeat(3, "node2".to_string(), 0, 0, 0);
        let response = node.handle_append_entries(&request);

        assert!(!response.success);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn test_candidate_steps_down_on_append_entries() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        node.start_election();

        let request = AppendEntriesRequest::heartbeat(1, "node2".to_string(), 0, 0, 0);
        let response = node.handle_append_entries(&request);

        assert!(response.success);
        assert!(node.is_follower());
    }

    #[test]
    fn test_commit_index_advancement() {
        let (mut node1, mut node2, _) = create_cluster();
        elect(&mut node1, "node3");

        node1.propose(b"k".to_vec()).unwrap();
        assert_eq!(node1.commit_index(), 0);

        let request = node1.create_append_entries("node2").unwrap();
        let response = node2.handle_append_entries(&request);
        node1.handle_append_entries_response(&response);

        assert_eq!(node1.commit_index(), 2);

        // The follower learns the new commit index on the next round
        let heartbeat = node1.create_append_entries("node2").unwrap();
        node2.handle_append_entries(&heartbeat);
        assert_eq!(node2.commit_index(), 2);
    }

    #[test]
    fn test_follower_conflict_is_repaired() {
        let (mut node1, mut node2, _) = create_cluster();

        // node2 holds an entry from a term that never committed
        node2.log.append(1, cmd("stale"));
        node2.log.append(1, cmd("stale"));
        node2.persistent.current_term = 1;

        node1.persistent.current_term = 1;
        elect(&mut node1, "node3");
        node1.propose(b"fresh".to_vec()).unwrap();

        replicate(&mut node1, &mut node2);

        assert_eq!(node2.log.last_index(), 2);
        assert_eq!(node2.log.get(1).unwrap().payload, EntryPayload::Noop);
        assert_eq!(node2.log.get(2).unwrap().payload, cmd("fresh"));
    }

    #[test]
    fn test_entries_to_apply() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);

        node.log.append(1, cmd("k1"));
        node.log.append(1, cmd("k2"));
        node.volatile.commit_index = 2;

        assert!(node.has_entries_to_apply());
        let entries = node.get_entries_to_apply();

        assert_eq!(entries.len(), 2);
        assert_eq!(node.volatile.last_applied, 2);
        assert!(!node.has_entries_to_apply());
    }

    #[test]
    fn test_full_election_simulation() {
        let (mut node1, mut node2, mut node3) = create_cluster();

        node1.start_election();
        let vote_request = node1.create_request_vote();

        let response2 = node2.handle_request_vote(&vote_request);
        let response3 = node3.handle_request_vote(&vote_request);

        assert!(response2.vote_granted);
        assert!(response3.vote_granted);

        node1.handle_request_vote_response(&response2);

        assert!(node1.is_leader());
    }
}

// ==================== Membership Tests ====================

mod membership_tests {
    use super::*;

    #[test]
    fn test_add_peer_takes_effect_on_append() {
        let mut leader = RaftNode::new("node1".to_string(), Vec::new());
        leader.enable_single_node();
        leader.bootstrap();

        let (index, term) = leader.propose_add_peer("node2").unwrap().unwrap();

        assert_eq!((index, term), (2, 1));
        assert_eq!(leader.peers, vec!["node2".to_string()]);
        assert_eq!(leader.quorum_size(), 2);
        // Needs the new member's acknowledgement to commit
        assert_eq!(leader.commit_index(), 1);
        assert_eq!(
            leader.log.get(2).unwrap().payload,
            EntryPayload::Membership(vec!["node1".to_string(), "node2".to_string()])
        );
    }

    #[test]
    fn test_add_existing_member_is_noop() {
        let mut leader = RaftNode::new("node1".to_string(), Vec::new());
        leader.enable_single_node();
        leader.bootstrap();

        assert_eq!(leader.propose_add_peer("node1"), Ok(None));
        leader.propose_add_peer("node2").unwrap();
        assert_eq!(leader.propose_add_peer("node2"), Ok(None));
        assert_eq!(leader.log.last_index(), 2);
    }

    #[test]
    fn test_one_membership_change_at_a_time() {
        let mut leader = RaftNode::new("node1".to_string(), Vec::new());
        leader.enable_single_node();
        leader.bootstrap();

        leader.propose_add_peer("node2").unwrap();
        assert_eq!(
            leader.propose_add_peer("node3"),
            Err(ProposeError::ConfigChangeInProgress)
        );
    }

    #[test]
    fn test_add_peer_requires_leader() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        assert!(matches!(
            node.propose_add_peer("node3"),
            Err(ProposeError::NotLeader { leader: None })
        ));
    }

    #[test]
    fn test_joining_node_learns_membership() {
        let mut leader = RaftNode::new("node1".to_string(), Vec::new());
        leader.enable_single_node();
        leader.bootstrap();
        let mut joiner = RaftNode::new("node2".to_string(), Vec::new());

        leader.propose_add_peer("node2").unwrap();
        node_sync(&mut leader, &mut joiner);

        assert_eq!(leader.commit_index(), 2);
        assert_eq!(joiner.peers, vec!["node1".to_string()]);
        assert_eq!(joiner.members().len(), 2);

        // With the first change committed, the next one is accepted
        assert!(leader.propose_add_peer("node3").unwrap().is_some());
        assert_eq!(leader.membership_at(2).len(), 2);
        assert_eq!(leader.membership_at(3).len(), 3);
    }

    #[test]
    fn test_truncated_membership_is_rolled_back() {
        let mut node = RaftNode::new("node2".to_string(), vec!["node1".to_string()]);
        let entries = vec![LogEntry::new(
            1,
            1,
            EntryPayload::Membership(vec!["node1".into(), "node2".into(), "node3".into()]),
        )];
        let request = AppendEntriesRequest::with_entries(1, "node1".to_string(), 0, 0, entries, 0);
        node.handle_append_entries(&request);
        assert_eq!(node.peers.len(), 2);

        // A new leader overwrites the uncommitted membership entry
        let entries = vec![LogEntry::new(2, 1, EntryPayload::Noop)];
        let request = AppendEntriesRequest::with_entries(2, "node1".to_string(), 0, 0, entries, 0);
        node.handle_append_entries(&request);
        assert_eq!(node.peers, vec!["node1".to_string()]);
    }

    fn node_sync(leader: &mut RaftNode, follower: &mut RaftNode) {
        for _ in 0..5 {
            let request = leader.create_append_entries(&follower.id).unwrap();
            let response = follower.handle_append_entries(&request);
            leader.handle_append_entries_response(&response);
        }
    }
}

// ==================== Snapshot Tests ====================

mod snapshot_tests {
    use super::*;

    fn leader_with_applied_entries(count: u8) -> (RaftNode, RaftNode, RaftNode) {
        let mut node1 = RaftNode::new("node1".to_string(), vec!["node2".to_string(), "node3".to_string()]);
        let node2 = RaftNode::new("node2".to_string(), vec!["node1".to_string(), "node3".to_string()]);
        let mut node3 = RaftNode::new("node3".to_string(), vec!["node1".to_string(), "node2".to_string()]);

        node1.start_election();
        node1.handle_request_vote_response(&RequestVoteResponse::granted(1, "node3".to_string()));
        for i in 0..count {
            node1.propose(vec![i]).unwrap();
        }
        let request = node1.create_append_entries("node3").unwrap();
        let response = node3.handle_append_entries(&request);
        node1.handle_append_entries_response(&response);
        node1.get_entries_to_apply();
        (node1, node2, node3)
    }

    #[test]
    fn test_should_snapshot_threshold() {
        let (node1, _, _) = leader_with_applied_entries(4);
        assert_eq!(node1.last_applied(), 5);
        assert!(node1.should_snapshot(5));
        assert!(!node1.should_snapshot(6));
        assert!(!node1.should_snapshot(0));
        assert_eq!(node1.snapshot_point(), Some((5, 1)));
    }

    #[test]
    fn test_compact_then_lagging_peer_needs_snapshot() {
        let (mut node1, mut node2, _) = leader_with_applied_entries(4);
        let members = node1.membership_at(5);
        node1.compact(5, 1, members);

        assert_eq!(node1.log.snapshot_index(), 5);
        assert!(node1.log.is_empty());
        assert!(node1.create_append_entries("node2").is_none());
        assert!(matches!(
            node1.create_replication("node2"),
            Some(Replication::Snapshot { term: 1, .. })
        ));

        let request = InstallSnapshotRequest {
            term: 1,
            leader_id: "node1".to_string(),
            last_included_index: 5,
            last_included_term: 1,
            members: node1.members(),
            data: Vec::new(),
        };
        assert!(matches!(node2.handle_install_snapshot(&request), SnapshotDecision::Install));
        let response = node2.complete_install_snapshot(5, 1, request.members.clone());
        assert!(response.success);
        assert_eq!(node2.last_applied(), 5);
        assert_eq!(node2.commit_index(), 5);

        node1.handle_install_snapshot_response(&response);
        assert!(matches!(
            node1.create_replication("node2"),
            Some(Replication::Append(ref r)) if r.prev_log_index == 5 && r.prev_log_term == 1
        ));

        node1.propose(b"after".to_vec()).unwrap();
        let request = node1.create_append_entries("node2").unwrap();
        let response = node2.handle_append_entries(&request);
        assert!(response.success);
        assert_eq!(node2.log.last_index(), 6);
    }

    #[test]
    fn test_compact_never_passes_last_applied() {
        let (mut node1, _, _) = leader_with_applied_entries(2);
        node1.propose(b"pending".to_vec()).unwrap();

        node1.compact(4, 1, node1.members());
        assert_eq!(node1.log.snapshot_index(), 0);
    }

    #[test]
    fn test_install_snapshot_stale_term_rejected() {
        let mut node = RaftNode::new("node2".to_string(), vec!["node1".to_string()]);
        node.persistent.current_term = 4;

        let request = InstallSnapshotRequest {
            term: 2,
            leader_id: "node1".to_string(),
            last_included_index: 10,
            last_included_term: 2,
            members: Vec::new(),
            data: Vec::new(),
        };
        match node.handle_install_snapshot(&request) {
            SnapshotDecision::Reject(response) => {
                assert!(!response.success);
                assert_eq!(response.term, 4);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_install_snapshot_already_applied() {
        let (_, _, mut node3) = leader_with_applied_entries(3);
        node3.volatile.update_commit_index(4);
        node3.get_entries_to_apply();

        let request = InstallSnapshotRequest {
            term: 1,
            leader_id: "node1".to_string(),
            last_included_index: 3,
            last_included_term: 1,
            members: Vec::new(),
            data: Vec::new(),
        };
        assert!(matches!(
            node3.handle_install_snapshot(&request),
            SnapshotDecision::UpToDate(ref r) if r.success && r.match_index == 3
        ));
    }

    #[test]
    fn test_restore_snapshot_on_startup() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);

        node.restore_snapshot(
            12,
            3,
            vec!["node1".to_string(), "node3".to_string()],
        );

        assert_eq!(node.log.last_index(), 12);
        assert_eq!(node.last_applied(), 12);
        assert_eq!(node.commit_index(), 12);
        assert_eq!(node.current_term(), 3);
        // Peers known before the restore are kept
        assert!(node.peers.contains(&"node2".to_string()));
        assert!(node.peers.contains(&"node3".to_string()));
    }

}

// ==================== Recovery Tests ====================

mod recovery_tests {
    use super::*;

    fn durable_log(term: u64, count: u64) -> RaftLog {
        let mut log = RaftLog::new();
        for i in 0..count {
            log.append(term, cmd(&i.to_string()));
        }
        log
    }

    #[test]
    fn test_recover_restores_term_vote_and_entries() {
        let mut node = RaftNode::new("node1".to_string(), vec!["node2".to_string()]);
        let hard_state = HardState {
            current_term: 5,
            voted_for: Some("node2".to_string()),
        };

        assert_eq!(node.recover(hard_state.clone(), &durable_log(4, 3)), 3);

        assert_eq!(node.hard_state(), hard_state);
        assert_eq!(node.log.last_index(), 3);
        assert_eq!(node.log.last_term(), 4);
        // Nothing is known to be committed until a leader says so
        assert_eq!(node.commit_index(), 0);
    }

    #[test]
    fn test_recovered_vote_is_not_given_twice() {
        let mut node = RaftNode::new(
            "node1".to_string(),
            vec!["node2".to_string(), "node3".to_string()],
        );
        node.recover(
            HardState {
                current_term: 2,
                voted_for: Some("node2".to_string()),
            },
            &RaftLog::new(),
        );

        let request = RequestVoteRequest::new(2, "node3".to_string(), 0, 0);
        let response = node.handle_request_vote(&request);
        assert!(!response.vote_granted);
    }

    #[test]
    fn test_recover_skips_entries_covered_by_snapshot() {
        let mut node = RaftNode::new("node1".to_string(), vec![]);
        node.restore_snapshot(3, 1, vec!["node1".to_string()]);

        let restored = node.recover(
            HardState {
                current_term: 1,
                voted_for: None,
            },
            &durable_log(1, 5),
        );

        assert_eq!(restored, 2);
        assert_eq!(node.log.snapshot_index(), 3);
        assert_eq!(node.log.last_index(), 5);
        assert_eq!(node.last_applied(), 3);
    }

    #[test]
    fn test_recover_ignores_log_that_does_not_reach_snapshot() {
        let mut node = RaftNode::new("node1".to_string(), vec![]);
        node.restore_snapshot(10, 2, vec!["node1".to_string()]);

        let mut log = RaftLog::new();
        log.reset_to_snapshot(12, 2);
        log.append(2, cmd("gap"));

        assert_eq!(node.recover(HardState::default(), &log), 0);
        assert_eq!(node.log.last_index(), 10);
        // An older hard state never lowers the term
        assert_eq!(node.current_term(), 2);
    }

    #[test]
    fn test_recovered_membership_takes_effect() {
        let mut log = RaftLog::new();
        log.append(1, EntryPayload::Noop);
        log.append(
            1,
            EntryPayload::Membership(vec!["node1".to_string(), "node2".to_string()]),
        );

        let mut node = RaftNode::new("node1".to_string(), vec![]);
        node.recover(
            HardState {
                current_term: 1,
                voted_for: Some("node1".to_string()),
            },
            &log,
        );
        assert_eq!(node.peers, vec!["node2".to_string()]);
    }

    #[test]
    fn test_single_node_recommits_recovered_entries() {
        let mut node = RaftNode::new("node1".to_string(), vec![]);
        node.enable_single_node();
        node.recover(
            HardState {
                current_term: 1,
                voted_for: Some("node1".to_string()),
            },
            &durable_log(1, 2),
        );

        node.start_election();
        assert!(node.is_leader());
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.get_entries_to_apply().len(), 3);
    }

    #[test]
    fn test_log_changes_are_queued_until_taken() {
        let mut log = durable_log(1, 3);
        log.truncate_after(1);
        log.compact_to(1, 1);

        let changes = log.take_changes();
        assert_eq!(changes.len(), 5);
        assert!(log.take_changes().is_empty());

        let mut replayed = RaftLog::new();
        for change in changes {
            assert!(replayed.apply_record(change));
        }
        assert_eq!(replayed.snapshot_index(), 1);
        assert_eq!(replayed.last_index(), 1);
    }
}
