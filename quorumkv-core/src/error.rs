//! Error types for the core crate.

use thiserror::Error;

/// Errors raised by a [`LocalStore`](crate::storage::LocalStore).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A key or value was not valid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// The underlying storage engine failed.
    #[error("storage engine error: {0}")]
    Engine(String),
}

/// Errors from encoding or decoding a [`Command`](crate::Command).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode command: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors from the finite state machine.
///
/// Any error returned from `apply` is fatal to the node; errors from
/// `snapshot` and `restore` are recoverable.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode snapshot: {0}")]
    SnapshotEncode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode snapshot: {0}")]
    SnapshotDecode(#[from] rmp_serde::decode::Error),

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the on-disk Raft state: log, hard state, snapshot store and
/// peer file.
#[derive(Debug, Error)]
pub enum RaftStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("failed to encode log record: {0}")]
    RecordEncode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode log record: {0}")]
    RecordDecode(#[from] rmp_serde::decode::Error),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),
}

/// Reasons a proposal is refused by the Raft node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProposeError {
    #[error("not the leader (leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("a membership change is already in progress")]
    ConfigChangeInProgress,
}
