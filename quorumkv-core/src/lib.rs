pub mod command;
pub mod error;
pub mod fsm;
pub mod raft;
pub mod storage;

pub use command::Command;
pub use error::{CommandError, FsmError, ProposeError, RaftStorageError, StoreError};
pub use fsm::{KvSnapshot, KvStateMachine};
pub use storage::{KvStore, LocalStore, SharedStore, StorageEngine};

// Re-export raft types
pub use raft::{
    EntryPayload, FileSnapshotStore, HardState, JsonPeers, LogEntry, NodeState, RaftLog,
    RaftNode, RaftWal, SnapshotMeta, SnapshotSink, StateMachine, StateMachineSnapshot,
};
pub use raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
