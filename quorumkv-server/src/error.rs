//! Error types for the server crate.

use std::time::Duration;

use thiserror::Error;

use quorumkv_core::{FsmError, ProposeError, RaftStorageError, StoreError};

/// A consensus address that no forwarding address can be derived from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0:?} has no port")]
    MissingPort(String),

    #[error("address {0:?} has no host")]
    MissingHost(String),

    #[error("address {0:?} has an invalid port")]
    InvalidPort(String),

    #[error("address {0:?} uses the highest port; port + 1 does not exist")]
    PortOverflow(String),
}

/// Failures of a single forwarding round trip.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,
}

/// Failures of a consensus RPC to a peer.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("peer needs a snapshot but none is stored")]
    NoSnapshot,

    #[error("failed to load snapshot: {0}")]
    Snapshot(#[from] RaftStorageError),
}

/// Errors from the consensus runtime.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Propose(#[from] ProposeError),

    #[error("entry was not applied within {0:?}")]
    Timeout(Duration),

    #[error("leadership lost before entry {index} was committed")]
    LeadershipLost { index: u64 },

    #[error("consensus halted after a fatal apply or log write error")]
    Halted,

    #[error("consensus is shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] RaftStorageError),

    #[error(transparent)]
    Fsm(#[from] FsmError),
}

/// Errors surfaced to callers of [`ClusterNode`](crate::ClusterNode).
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("no leader is known; retry later")]
    LeaderUnknown,

    #[error("forwarding failed: {0}")]
    Forward(#[from] ForwardError),

    /// Error text returned by the peer that handled a forwarded request.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node is already started")]
    AlreadyStarted,
}
