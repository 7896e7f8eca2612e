pub mod state;
pub mod log;
pub mod message;
pub mod node;
pub mod snapshot;
pub mod peers;
pub mod state_machine;
pub mod wal;

pub use state::{ElectionConfig, NodeState, PersistentState, VolatileState};
pub use log::{EntryPayload, LogEntry, RaftLog};
pub use message::{
    RaftMessage,
    AppendEntriesRequest, AppendEntriesResponse,
    RequestVoteRequest, RequestVoteResponse,
    InstallSnapshotRequest, InstallSnapshotResponse,
};
pub use node::{RaftNode, Replication, SnapshotDecision};
pub use snapshot::{FileSnapshotSink, FileSnapshotStore, SnapshotMeta, SnapshotSink};
pub use peers::JsonPeers;
pub use state_machine::{StateMachine, StateMachineSnapshot};
pub use wal::{HardState, RaftWal, Recovered, WalRecord};
