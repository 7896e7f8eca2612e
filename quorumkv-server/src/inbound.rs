//! Listener for operations forwarded by peers.
//!
//! Every node accepts forwarded requests on its forwarding address and turns
//! them into consensus calls. Callers are not authenticated.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quorumkv_core::{Command, FsmError};

use crate::consensus::Consensus;
use crate::error::{ConsensusError, NodeError};
use crate::forward::{ForwardRequest, ForwardResponse};

/// Answer one forwarded request. `timeout` bounds the wait for the entry to
/// be applied.
pub async fn handle_forward_request(
    consensus: &Consensus,
    request: ForwardRequest,
    timeout: Duration,
) -> ForwardResponse {
    match execute(consensus, request, timeout).await {
        Ok(()) => ForwardResponse::Ok,
        Err(e) => ForwardResponse::error(e.to_string()),
    }
}

/// Submit a request to consensus and wait for it to be applied here.
pub(crate) async fn execute(
    consensus: &Consensus,
    request: ForwardRequest,
    timeout: Duration,
) -> Result<(), ConsensusError> {
    match request {
        ForwardRequest::Set { key, value } => {
            submit(consensus, Command::Set { key, value }, timeout).await
        }
        ForwardRequest::Delete { key } => submit(consensus, Command::Delete { key }, timeout).await,
        ForwardRequest::Join { addr } => {
            consensus.add_peer(&addr, timeout).await?;
            info!(node = %consensus.id(), peer = %addr, "join accepted");
            Ok(())
        }
    }
}

async fn submit(
    consensus: &Consensus,
    command: Command,
    timeout: Duration,
) -> Result<(), ConsensusError> {
    let payload = command.encode().map_err(FsmError::from)?;
    consensus.append_and_commit(payload, timeout).await?;
    info!(
        node = %consensus.id(),
        op = command.name(),
        key = command.key(),
        "applied forwarded command"
    );
    Ok(())
}

/// Accept loop on the forwarding address
pub struct InboundServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl InboundServer {
    pub async fn bind(
        addr: &str,
        consensus: Arc<Consensus>,
        apply_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, rx) = watch::channel(false);

        info!(%local_addr, "forwarding listener started");
        let task = tokio::spawn(accept_loop(listener, consensus, apply_timeout, rx));

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already accepted run to completion.
    pub async fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for InboundServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    consensus: Arc<Consensus>,
    apply_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    let consensus = Arc::clone(&consensus);
                    tokio::spawn(async move {
                        handle_connection(socket, peer_addr, consensus, apply_timeout).await;
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept forwarded connection"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("forwarding listener stopped");
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    consensus: Arc<Consensus>,
    apply_timeout: Duration,
) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %peer_addr, error = %e, "error reading forwarded request");
                return;
            }
        }

        let response = match serde_json::from_str::<ForwardRequest>(line.trim()) {
            Ok(request) => handle_forward_request(&consensus, request, apply_timeout).await,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "malformed forwarded request");
                ForwardResponse::error(format!("malformed request: {}", e))
            }
        };

        let mut json = match serde_json::to_vec(&response) {
            Ok(json) => json,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "failed to encode response");
                return;
            }
        };
        json.push(b'\n');

        if writer.write_all(&json).await.is_err() {
            return;
        }
    }
}
