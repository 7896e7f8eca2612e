use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use quorumkv_core::raft::node::Replication;
use quorumkv_core::{
    AppendEntriesResponse, FileSnapshotStore, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftMessage, RequestVoteResponse,
};

use crate::consensus::{take_snapshot, ConsensusState};
use crate::error::RpcError;
use crate::raft_handler::apply_committed_entries;

/// Lower bound on the time allowed for an InstallSnapshot round trip.
const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the Raft tick loop - drives elections, replication, log application
/// and snapshots until shutdown.
pub(crate) async fn run_raft_tick_loop(
    state: Arc<ConsensusState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tick_interval = state.timings.tick_interval();
    let heartbeat_interval = state.timings.heartbeat_interval();
    let mut last_heartbeat = Instant::now();
    let mut replicate_now = false;

    loop {
        if state.is_stopped() {
            break;
        }

        // ==================== Check Election Timeout ====================
        let election = {
            let mut raft = state.raft.write().await;
            if raft.should_start_election() {
                raft.start_election();
                if state.persist(&mut raft).is_err() {
                    None
                } else if raft.is_leader() {
                    replicate_now = true;
                    None
                } else {
                    Some((raft.create_request_vote(), raft.peers.clone()))
                }
            } else {
                None
            }
        };

        if let Some((request, peers)) = election {
            debug!(node = %state.id, term = request.term, "election timeout; requesting votes");
            for peer in peers {
                let msg = RaftMessage::RequestVote(request.clone());
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let timeout = state.timings.rpc_timeout();
                    if let Err(e) = send_raft_message(&state, &peer, msg, timeout).await {
                        trace!(peer = %peer, error = %e, "RequestVote failed");
                    }
                });
            }
        }

        // ==================== Leader: Replicate ====================
        if replicate_now || last_heartbeat.elapsed() >= heartbeat_interval {
            broadcast_replication(&state).await;
            last_heartbeat = Instant::now();
            replicate_now = false;
        }

        // ==================== Apply Committed Entries ====================
        apply_committed_entries(&state).await;

        // ==================== Snapshot ====================
        maybe_snapshot(&state).await;

        tokio::select! {
            _ = tokio::time::sleep(tick_interval) => {}
            _ = state.replicate.notified() => replicate_now = true,
            _ = shutdown.changed() => {}
        }
    }

    debug!(node = %state.id, "tick loop stopped");
}

/// Send every peer what it needs next: entries, a heartbeat or a snapshot.
async fn broadcast_replication(state: &Arc<ConsensusState>) {
    let replications = {
        let raft = state.raft.read().await;
        raft.create_replications()
    };

    for (peer, replication) in replications {
        let state = Arc::clone(state);
        match replication {
            Replication::Append(request) => {
                tokio::spawn(async move {
                    let timeout = state.timings.rpc_timeout();
                    let msg = RaftMessage::AppendEntries(request);
                    if let Err(e) = send_raft_message(&state, &peer, msg, timeout).await {
                        // Failures are normal while a peer is down or partitioned
                        trace!(peer = %peer, error = %e, "AppendEntries failed");
                    }
                });
            }
            Replication::Snapshot { term, leader_id } => {
                if !state.snapshot_inflight.lock().insert(peer.clone()) {
                    continue;
                }
                tokio::spawn(async move {
                    if let Err(e) = send_snapshot(&state, &peer, term, leader_id).await {
                        warn!(peer = %peer, error = %e, "InstallSnapshot failed");
                    }
                    state.snapshot_inflight.lock().remove(&peer);
                });
            }
        }
    }
}

async fn send_snapshot(
    state: &Arc<ConsensusState>,
    peer: &str,
    term: u64,
    leader_id: String,
) -> Result<(), RpcError> {
    let request = snapshot_request(&state.snapshots, term, leader_id)?;
    info!(peer, index = request.last_included_index, "sending snapshot");
    let timeout = state.timings.rpc_timeout().max(SNAPSHOT_RPC_TIMEOUT);
    send_raft_message(state, peer, RaftMessage::InstallSnapshot(request), timeout).await
}

/// InstallSnapshot carrying the newest stored snapshot.
fn snapshot_request(
    snapshots: &FileSnapshotStore,
    term: u64,
    leader_id: String,
) -> Result<InstallSnapshotRequest, RpcError> {
    let latest = snapshots.latest()?.ok_or(RpcError::NoSnapshot)?;
    let (meta, data) = snapshots.read(&latest.id)?;
    Ok(InstallSnapshotRequest {
        term,
        leader_id,
        last_included_index: meta.index,
        last_included_term: meta.term,
        members: meta.members,
        data,
    })
}

/// Start a snapshot in the background once enough has been applied.
async fn maybe_snapshot(state: &Arc<ConsensusState>) {
    let due = {
        let raft = state.raft.read().await;
        raft.should_snapshot(state.snapshot_threshold)
    };
    if !due || state.snapshot_running.swap(true, Ordering::SeqCst) {
        return;
    }

    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = take_snapshot(&state, false).await {
            warn!(node = %state.id, error = %e, "snapshot failed");
        }
        state.snapshot_running.store(false, Ordering::SeqCst);
    });
}

/// Send a Raft message to a peer and handle the response
pub(crate) async fn send_raft_message(
    state: &Arc<ConsensusState>,
    peer_addr: &str,
    message: RaftMessage,
    timeout: Duration,
) -> Result<(), RpcError> {
    let response_line = tokio::time::timeout(timeout, exchange(peer_addr, &message))
        .await
        .map_err(|_| RpcError::Timeout(timeout))??;

    match &message {
        RaftMessage::RequestVote(_) => {
            let response: RequestVoteResponse = serde_json::from_str(&response_line)?;
            let mut raft = state.raft.write().await;
            let won = raft.handle_request_vote_response(&response);
            if state.persist(&mut raft).is_ok() && won {
                state.replicate.notify_one();
            }
        }
        RaftMessage::AppendEntries(_) => {
            let response: AppendEntriesResponse = serde_json::from_str(&response_line)?;
            let mut raft = state.raft.write().await;
            raft.handle_append_entries_response(&response);
            // A failed write halts the node
            let _ = state.persist(&mut raft);
        }
        RaftMessage::InstallSnapshot(_) => {
            let response: InstallSnapshotResponse = serde_json::from_str(&response_line)?;
            let mut raft = state.raft.write().await;
            raft.handle_install_snapshot_response(&response);
            let _ = state.persist(&mut raft);
        }
    }

    Ok(())
}

/// One request line out, one response line back.
async fn exchange(peer_addr: &str, message: &RaftMessage) -> Result<String, RpcError> {
    let stream = TcpStream::connect(peer_addr)
        .await
        .map_err(|source| RpcError::Connect {
            addr: peer_addr.to_string(),
            source,
        })?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    writer.write_all(&json).await?;

    let mut response_line = String::new();
    if reader.read_line(&mut response_line).await? == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    Ok(response_line)
}
