use std::io::Read;

use crate::error::FsmError;
use crate::raft::snapshot::SnapshotSink;

/// The replicated state the consensus runtime drives.
///
/// `apply` is called once per committed command, strictly in index order and
/// never concurrently with itself, `snapshot` or `restore`. An error from
/// `apply` is fatal: the runtime stops rather than let this replica diverge.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, data: &[u8]) -> Result<(), FsmError>;

    /// Capture a point-in-time view. Persisting it may happen later and
    /// concurrently with `apply`.
    fn snapshot(&self) -> Result<Box<dyn StateMachineSnapshot>, FsmError>;

    /// Replace the whole state with a snapshot read from `source`.
    fn restore(&self, source: &mut dyn Read) -> Result<(), FsmError>;
}

/// A captured snapshot, ready to be written out.
pub trait StateMachineSnapshot: Send {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), FsmError>;

    /// Called once the snapshot is no longer needed.
    fn release(&mut self) {}
}
