use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use quorumkv_core::RaftMessage;

use crate::consensus::ConsensusState;
use crate::raft_handler::handle_raft_message;

/// Run the peer communication server - handles Raft RPC from other nodes
pub(crate) async fn run_peer_server(
    listener: TcpListener,
    state: Arc<ConsensusState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(node = %state.id, "peer server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        handle_peer_connection(socket, state, peer_addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept peer connection");
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!(node = %state.id, "peer server stopped");
}

/// Handle a single peer connection
async fn handle_peer_connection(
    socket: TcpStream,
    state: Arc<ConsensusState>,
    peer_addr: SocketAddr,
) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => return, // Connection closed
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "error reading from peer");
                return;
            }
        }

        // A halted or stopped node no longer takes part in consensus.
        if state.is_stopped() {
            return;
        }

        let message: RaftMessage = match serde_json::from_str(line.trim()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "invalid message from peer");
                let _ = writer.write_all(b"ERROR: Invalid message format\n").await;
                continue;
            }
        };

        let mut response = match handle_raft_message(&state, message).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "failed to encode response");
                return;
            }
        };
        response.push('\n');

        if let Err(e) = writer.write_all(response.as_bytes()).await {
            debug!(peer = %peer_addr, error = %e, "failed to send response");
            return;
        }
    }
}
