use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use quorumkv_core::{KvStateMachine, LocalStore, SharedStore, SnapshotMeta, StoreError};

use crate::address::forwarding_addr;
use crate::config::NodeConfig;
use crate::consensus::{Consensus, ConsensusStatus};
use crate::error::NodeError;
use crate::forward::{send_forward, ForwardRequest, ForwardResponse};
use crate::inbound::InboundServer;
use crate::router::RequestRouter;

/// Cluster node - binds a local store, its state machine and the consensus
/// runtime, and exposes the public key-value API.
pub struct ClusterNode {
    config: NodeConfig,

    /// Consensus port + 1 on the consensus host
    forward_addr: String,

    store: SharedStore,
    consensus: Arc<Consensus>,
    router: RequestRouter,

    /// Forwarding listener, present once started
    inbound: Mutex<Option<InboundServer>>,
}

impl ClusterNode {
    /// Create the node and start consensus. Forwarded requests are only
    /// accepted after [`start`](Self::start).
    pub async fn new(config: NodeConfig, store: impl LocalStore) -> Result<Self, NodeError> {
        config.validate()?;
        let forward_addr = forwarding_addr(&config.raft_addr)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = SharedStore::new(store);
        let fsm = Arc::new(KvStateMachine::new(store.clone()));
        let consensus = Arc::new(Consensus::start(&config, fsm).await?);
        let router = RequestRouter::new(
            Arc::clone(&consensus),
            config.apply_timeout(),
            config.forward_timeout(),
        );

        info!(
            node = %config.raft_addr,
            forward_addr = %forward_addr,
            data_dir = %config.data_dir.display(),
            "cluster node created"
        );

        Ok(Self {
            config,
            forward_addr,
            store,
            consensus,
            router,
            inbound: Mutex::new(None),
        })
    }

    /// Read from the local store. No consensus round trip, so a follower may
    /// return a stale value.
    pub fn get(&self, key: &str) -> Result<Option<String>, NodeError> {
        match self.store.get(key.as_bytes())? {
            Some(bytes) => {
                let value = String::from_utf8(bytes).map_err(|_| StoreError::InvalidUtf8("value"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Replicate a set and wait until the leader has applied it.
    pub async fn set(&self, key: &str, value: &str) -> Result<(), NodeError> {
        self.router.set(key, value).await
    }

    /// Replicate a delete and wait until the leader has applied it.
    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        self.router.delete(key).await
    }

    /// Add the node at consensus address `addr` to the cluster.
    pub async fn join(&self, addr: &str) -> Result<(), NodeError> {
        self.router.join(addr).await
    }

    /// Ask the member at consensus address `member_addr` to add this node.
    pub async fn request_join(&self, member_addr: &str) -> Result<(), NodeError> {
        let addr = forwarding_addr(member_addr)?;
        let request = ForwardRequest::Join {
            addr: self.config.raft_addr.clone(),
        };
        info!(node = %self.config.raft_addr, member = member_addr, "requesting to join");
        match send_forward(&addr, &request, self.config.forward_timeout()).await? {
            ForwardResponse::Ok => Ok(()),
            ForwardResponse::Error { message } => Err(NodeError::Remote(message)),
        }
    }

    /// Begin accepting forwarded requests.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.is_some() {
            return Err(NodeError::AlreadyStarted);
        }
        let server = InboundServer::bind(
            &self.forward_addr,
            Arc::clone(&self.consensus),
            self.config.apply_timeout(),
        )
        .await?;
        *inbound = Some(server);
        Ok(())
    }

    /// Stop the forwarding listener and the consensus runtime.
    pub async fn close(&self) {
        if let Some(mut server) = self.inbound.lock().await.take() {
            server.close().await;
        }
        self.consensus.shutdown().await;
        info!(node = %self.config.raft_addr, "cluster node closed");
    }

    pub fn raft_addr(&self) -> &str {
        &self.config.raft_addr
    }

    pub fn forward_addr(&self) -> &str {
        &self.forward_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn leader(&self) -> Option<String> {
        self.consensus.current_leader().await
    }

    pub async fn is_leader(&self) -> bool {
        self.consensus.is_leader().await
    }

    /// Get node state for diagnostics
    pub async fn status(&self) -> ConsensusStatus {
        self.consensus.status().await
    }

    /// Snapshot the state machine now. `None` if nothing new was applied.
    pub async fn snapshot(&self) -> Result<Option<SnapshotMeta>, NodeError> {
        Ok(self.consensus.snapshot_now().await?)
    }
}
