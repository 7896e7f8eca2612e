use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cluster_node::ClusterNode;
use crate::handler::handle_client;

/// Accept text clients on `listener` until `shutdown` flips.
pub async fn run(listener: TcpListener, node: Arc<ClusterNode>, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "client listener started");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => {
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        handle_client(socket, node).await;
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept client connection"),
            },
            _ = shutdown.changed() => break,
        }
    }
}
