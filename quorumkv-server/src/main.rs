use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quorumkv_core::KvStore;
use quorumkv_server::{server, ClusterNode, NodeConfig};

const JOIN_ATTEMPTS: u32 = 10;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::from_env();
    info!(
        raft_addr = %config.raft_addr,
        data_dir = %config.data_dir.display(),
        enable_single = config.enable_single,
        "starting node"
    );

    let node = Arc::new(
        ClusterNode::new(config.clone(), KvStore::new())
            .await
            .context("failed to create node")?,
    );
    node.start().await.context("failed to start forwarding listener")?;

    if let Some(member) = &config.join {
        join_cluster(&node, member).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client_task = match &config.client_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind client listener on {}", addr))?;
            Some(tokio::spawn(server::run(listener, Arc::clone(&node), shutdown_rx)))
        }
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    shutdown_tx.send_replace(true);
    if let Some(task) = client_task {
        let _ = task.await;
    }
    node.close().await;
    Ok(())
}

/// Ask `member` to add this node, retrying while the cluster settles.
async fn join_cluster(node: &ClusterNode, member: &str) -> anyhow::Result<()> {
    for attempt in 1..=JOIN_ATTEMPTS {
        match node.request_join(member).await {
            Ok(()) => {
                info!(member, "joined cluster");
                return Ok(());
            }
            Err(e) if attempt < JOIN_ATTEMPTS => {
                warn!(member, attempt, error = %e, "join failed; retrying");
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
            Err(e) => {
                error!(member, error = %e, "giving up on join");
                return Err(e).with_context(|| format!("failed to join cluster via {}", member));
            }
        }
    }
    Ok(())
}
