//! Location-transparent writes and joins.
//!
//! Any node accepts `set`, `delete` and `join`. The router finds the current
//! leader and either runs the operation locally or forwards it to the
//! leader's forwarding address. Exactly one attempt is made per call.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use quorumkv_core::Command;

use crate::address::forwarding_addr;
use crate::consensus::Consensus;
use crate::error::NodeError;
use crate::forward::{send_forward, ForwardRequest, ForwardResponse};
use crate::inbound::execute;

pub struct RequestRouter {
    consensus: Arc<Consensus>,
    apply_timeout: Duration,
    forward_timeout: Duration,
}

impl RequestRouter {
    pub fn new(consensus: Arc<Consensus>, apply_timeout: Duration, forward_timeout: Duration) -> Self {
        Self {
            consensus,
            apply_timeout,
            forward_timeout,
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), NodeError> {
        self.command(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        self.command(Command::delete(key)).await
    }

    /// Add `addr` (a consensus address) to the cluster. With no leader known
    /// the request goes to this node, so a fresh single node can accept its
    /// first join.
    pub async fn join(&self, addr: &str) -> Result<(), NodeError> {
        let leader = match self.consensus.current_leader().await {
            Some(leader) => leader,
            None => self.consensus.id().to_string(),
        };
        let request = ForwardRequest::Join {
            addr: addr.to_string(),
        };
        self.route(&leader, request).await
    }

    async fn command(&self, command: Command) -> Result<(), NodeError> {
        let leader = self
            .consensus
            .current_leader()
            .await
            .ok_or(NodeError::LeaderUnknown)?;
        self.route(&leader, ForwardRequest::from(command)).await
    }

    async fn route(&self, leader: &str, request: ForwardRequest) -> Result<(), NodeError> {
        if leader == self.consensus.id() {
            execute(&self.consensus, request, self.apply_timeout).await?;
            return Ok(());
        }

        let addr = forwarding_addr(leader)?;
        debug!(leader, %addr, ?request, "forwarding to leader");
        match send_forward(&addr, &request, self.forward_timeout).await? {
            ForwardResponse::Ok => Ok(()),
            ForwardResponse::Error { message } => Err(NodeError::Remote(message)),
        }
    }
}
