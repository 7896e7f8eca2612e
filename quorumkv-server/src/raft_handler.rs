use std::io::Write;
use std::sync::Arc;

use tracing::{error, info, warn};

use quorumkv_core::raft::node::SnapshotDecision;
use quorumkv_core::{
    AppendEntriesResponse, EntryPayload, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftMessage, RequestVoteResponse,
};

use crate::consensus::ConsensusState;

/// Handle incoming Raft RPC messages. Returns the JSON response line.
///
/// Nothing is granted or acknowledged unless the change behind it was
/// persisted first.
pub(crate) async fn handle_raft_message(
    state: &Arc<ConsensusState>,
    message: RaftMessage,
) -> Result<String, serde_json::Error> {
    match message {
        // ============ ELECTION MESSAGES ============
        RaftMessage::RequestVote(req) => {
            let mut raft = state.raft.write().await;
            let mut response = raft.handle_request_vote(&req);
            if state.persist(&mut raft).is_err() {
                response = RequestVoteResponse::denied(raft.current_term(), raft.id.clone());
            }
            serde_json::to_string(&response)
        }

        // ============ LOG REPLICATION MESSAGES ============
        RaftMessage::AppendEntries(req) => {
            let mut raft = state.raft.write().await;
            let mut response = raft.handle_append_entries(&req);
            if state.persist(&mut raft).is_err() {
                response = AppendEntriesResponse::failure(
                    raft.current_term(),
                    raft.id.clone(),
                    raft.commit_index(),
                );
            }
            serde_json::to_string(&response)
        }

        // ============ SNAPSHOT MESSAGES ============
        RaftMessage::InstallSnapshot(req) => {
            let response = install_snapshot(state, req).await;
            serde_json::to_string(&response)
        }
    }
}

/// Replace local state with the leader's snapshot. Nothing is applied
/// while this runs.
async fn install_snapshot(
    state: &Arc<ConsensusState>,
    req: InstallSnapshotRequest,
) -> InstallSnapshotResponse {
    let _gate = state.apply_gate.lock().await;

    let decision = {
        let mut raft = state.raft.write().await;
        let decision = raft.handle_install_snapshot(&req);
        if state.persist(&mut raft).is_err() {
            return InstallSnapshotResponse::failure(raft.current_term(), raft.id.clone());
        }
        decision
    };
    match decision {
        SnapshotDecision::Reject(response) | SnapshotDecision::UpToDate(response) => {
            return response;
        }
        SnapshotDecision::Install => {}
    }

    let stored = state
        .snapshots
        .create(req.last_included_index, req.last_included_term, req.members.clone())
        .and_then(|mut sink| {
            sink.write_all(&req.data)?;
            sink.close()
        });
    // Nothing is replaced until the snapshot is on disk
    if let Err(e) = stored {
        warn!(
            node = %state.id,
            index = req.last_included_index,
            error = %e,
            "failed to store snapshot from leader"
        );
        let raft = state.raft.read().await;
        return InstallSnapshotResponse::failure(raft.current_term(), raft.id.clone());
    }

    if let Err(e) = state.fsm.restore(&mut req.data.as_slice()) {
        warn!(
            node = %state.id,
            index = req.last_included_index,
            error = %e,
            "failed to restore snapshot from leader"
        );
        let raft = state.raft.read().await;
        return InstallSnapshotResponse::failure(raft.current_term(), raft.id.clone());
    }

    let mut raft = state.raft.write().await;
    let response = raft.complete_install_snapshot(
        req.last_included_index,
        req.last_included_term,
        req.members,
    );
    if state.persist(&mut raft).is_err() {
        return InstallSnapshotResponse::failure(raft.current_term(), raft.id.clone());
    }
    drop(raft);
    state.fail_pending_through(req.last_included_index);
    response
}

/// Deliver committed entries to the state machine, in order, and wake the
/// callers waiting on them.
pub(crate) async fn apply_committed_entries(state: &Arc<ConsensusState>) {
    if state.is_halted() {
        return;
    }

    let _gate = state.apply_gate.lock().await;

    let entries = {
        let mut raft = state.raft.write().await;
        if !raft.has_entries_to_apply() {
            return;
        }
        raft.get_entries_to_apply()
    };

    for entry in entries {
        match &entry.payload {
            EntryPayload::Command(data) => {
                if let Err(e) = state.fsm.apply(entry.index, data) {
                    error!(
                        node = %state.id,
                        index = entry.index,
                        error = %e,
                        "failed to apply committed entry"
                    );
                    state.halt();
                    return;
                }
            }
            EntryPayload::Membership(members) => {
                let previous = match state.peer_store.peers() {
                    Ok(peers) => peers,
                    Err(e) => {
                        warn!(node = %state.id, error = %e, "failed to read stored peers");
                        Vec::new()
                    }
                };
                for member in members.iter().filter(|m| !previous.contains(*m)) {
                    if *member != state.id {
                        info!(node = %state.id, "node at {} joined", member);
                    }
                }
                if let Err(e) = state.peer_store.set_peers(members) {
                    warn!(node = %state.id, error = %e, "failed to persist peers");
                }
            }
            EntryPayload::Noop => {}
        }
        state.complete(entry.index, entry.term);
    }
}
