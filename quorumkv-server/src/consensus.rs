//! The consensus runtime: a [`RaftNode`] plus the tasks that drive it.
//!
//! Callers see the small interface the node coordinator needs:
//! append-and-wait-for-commit, current leader, add a peer. The state
//! machine is called back for every committed entry, for snapshots and for
//! restores.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use quorumkv_core::raft::{
    FileSnapshotStore, JsonPeers, NodeState, RaftWal, SnapshotMeta, StateMachine,
    StateMachineSnapshot,
};
use quorumkv_core::RaftNode;

use crate::config::{NodeConfig, RaftTimings};
use crate::error::ConsensusError;
use crate::peer_server::run_peer_server;
use crate::raft_tick_loop::run_raft_tick_loop;

type Waiter = oneshot::Sender<Result<(), ConsensusError>>;

/// A caller waiting for the entry at some index to be applied.
struct Pending {
    term: u64,
    tx: Waiter,
}

/// Shared by the tick loop, the peer server and the public handle.
pub(crate) struct ConsensusState {
    pub(crate) id: String,
    pub(crate) raft: RwLock<RaftNode>,
    pub(crate) fsm: Arc<dyn StateMachine>,
    /// Term, vote and log entries. Written under the `raft` write lock.
    wal: parking_lot::Mutex<RaftWal>,
    pub(crate) snapshots: FileSnapshotStore,
    pub(crate) peer_store: JsonPeers,
    /// Held while entries are delivered to the state machine, while a
    /// snapshot is captured and while one is installed.
    pub(crate) apply_gate: Mutex<()>,
    /// Serializes snapshot creation.
    pub(crate) snapshot_lock: Mutex<()>,
    pub(crate) snapshot_running: AtomicBool,
    /// Peers currently being sent a snapshot.
    pub(crate) snapshot_inflight: parking_lot::Mutex<HashSet<String>>,
    pending: parking_lot::Mutex<HashMap<u64, Pending>>,
    halted: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Wakes the tick loop to replicate right away.
    pub(crate) replicate: Notify,
    pub(crate) timings: RaftTimings,
    pub(crate) snapshot_threshold: u64,
}

impl ConsensusState {
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown.borrow() || self.is_halted()
    }

    /// Stop for good after a fatal apply or log write error.
    pub(crate) fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(node = %self.id, "halting consensus; this node will not apply further entries");
        self.shutdown.send_replace(true);
        self.fail_pending(|_| ConsensusError::Halted);
    }

    /// Make the term, vote and log changes made under this write lock
    /// durable. Must run before anything is sent that depends on them. A
    /// node that cannot write its log halts.
    pub(crate) fn persist(&self, raft: &mut RaftNode) -> Result<(), ConsensusError> {
        if let Err(e) = self.wal.lock().sync(raft) {
            error!(node = %self.id, error = %e, "failed to persist raft state");
            self.halt();
            return Err(e.into());
        }
        Ok(())
    }

    fn register(&self, index: u64, term: u64, tx: Waiter) {
        self.pending.lock().insert(index, Pending { term, tx });
    }

    fn forget(&self, index: u64) {
        self.pending.lock().remove(&index);
    }

    /// Resolve the waiter for `index`, if any, now that an entry of `term`
    /// has been applied there.
    pub(crate) fn complete(&self, index: u64, term: u64) {
        if let Some(pending) = self.pending.lock().remove(&index) {
            let result = if pending.term == term {
                Ok(())
            } else {
                Err(ConsensusError::LeadershipLost { index })
            };
            let _ = pending.tx.send(result);
        }
    }

    /// Fail every waiter at or below `index`; those entries were replaced
    /// by a snapshot and will never be applied one by one.
    pub(crate) fn fail_pending_through(&self, index: u64) {
        let mut pending = self.pending.lock();
        let covered: Vec<u64> = pending.keys().copied().filter(|i| *i <= index).collect();
        for i in covered {
            if let Some(p) = pending.remove(&i) {
                let _ = p.tx.send(Err(ConsensusError::LeadershipLost { index: i }));
            }
        }
    }

    fn fail_pending(&self, err: impl Fn(u64) -> ConsensusError) {
        for (index, pending) in self.pending.lock().drain() {
            let _ = pending.tx.send(Err(err(index)));
        }
    }
}

/// Point-in-time view of the consensus state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub id: String,
    pub state: NodeState,
    pub term: u64,
    pub leader: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub snapshot_index: u64,
    pub members: Vec<String>,
}

impl fmt::Display for ConsensusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node={} state={} term={} leader={} committed={} applied={} members={}",
            self.id,
            self.state,
            self.term,
            self.leader.as_deref().unwrap_or("none"),
            self.commit_index,
            self.last_applied,
            self.members.join(",")
        )
    }
}

/// Handle to a running consensus runtime. Dropping it stops the runtime.
pub struct Consensus {
    state: Arc<ConsensusState>,
    local_addr: SocketAddr,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Consensus {
    /// Recover local state, bind the consensus address and start ticking.
    pub async fn start(
        config: &NodeConfig,
        fsm: Arc<dyn StateMachine>,
    ) -> Result<Self, ConsensusError> {
        std::fs::create_dir_all(&config.data_dir)?;

        let peer_store = JsonPeers::new(&config.data_dir);
        let known = peer_store.peers()?;
        let snapshots = FileSnapshotStore::open(&config.data_dir, config.snapshot.retain)?;

        let mut raft = RaftNode::with_config(
            config.raft_addr.clone(),
            known.clone(),
            config.raft.election_config(),
        );
        raft.max_append_entries = config.raft.max_append_entries;

        if config.enable_single && known.len() <= 1 {
            info!(node = %config.raft_addr, "enabling single-node mode");
            raft.enable_single_node();
        }

        if let Some(latest) = snapshots.latest()? {
            let (meta, data) = snapshots.read(&latest.id)?;
            fsm.restore(&mut data.as_slice())?;
            raft.restore_snapshot(meta.index, meta.term, meta.members);
            info!(
                node = %config.raft_addr,
                snapshot = %meta.id,
                index = meta.index,
                "restored from snapshot"
            );
        }

        let (mut wal, recovered) = RaftWal::open(&config.data_dir)?;
        let restored = raft.recover(recovered.hard_state, &recovered.log);
        wal.sync(&mut raft)?;
        info!(
            node = %config.raft_addr,
            term = raft.current_term(),
            entries = restored,
            last_index = raft.log.last_index(),
            "recovered raft log"
        );

        let listener = TcpListener::bind(&config.raft_addr).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ConsensusState {
            id: config.raft_addr.clone(),
            raft: RwLock::new(raft),
            fsm,
            wal: parking_lot::Mutex::new(wal),
            snapshots,
            peer_store,
            apply_gate: Mutex::new(()),
            snapshot_lock: Mutex::new(()),
            snapshot_running: AtomicBool::new(false),
            snapshot_inflight: parking_lot::Mutex::new(HashSet::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            halted: AtomicBool::new(false),
            shutdown,
            replicate: Notify::new(),
            timings: config.raft.clone(),
            snapshot_threshold: config.snapshot.threshold,
        });

        let peer_task = tokio::spawn(run_peer_server(
            listener,
            Arc::clone(&state),
            state.shutdown.subscribe(),
        ));
        let tick_task = tokio::spawn(run_raft_tick_loop(
            Arc::clone(&state),
            state.shutdown.subscribe(),
        ));

        info!(node = %state.id, %local_addr, "consensus started");

        Ok(Self {
            state,
            local_addr,
            tasks: parking_lot::Mutex::new(vec![peer_task, tick_task]),
        })
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_halted(&self) -> bool {
        self.state.is_halted()
    }

    fn ensure_running(&self) -> Result<(), ConsensusError> {
        if self.state.is_halted() {
            return Err(ConsensusError::Halted);
        }
        if *self.state.shutdown.borrow() {
            return Err(ConsensusError::Shutdown);
        }
        Ok(())
    }

    /// Append `payload` to the log and wait until the leader has applied it.
    ///
    /// On timeout the entry may still commit later.
    pub async fn append_and_commit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        self.ensure_running()?;

        let (tx, rx) = oneshot::channel();
        let index = {
            let mut raft = self.state.raft.write().await;
            let (index, term) = raft.propose(payload)?;
            self.state.persist(&mut raft)?;
            self.state.register(index, term, tx);
            index
        };
        self.state.replicate.notify_one();

        self.wait_for(index, rx, timeout).await
    }

    /// Add `addr` to the voter set and wait until the change is applied.
    /// Adding an existing member succeeds without a log entry.
    pub async fn add_peer(&self, addr: &str, timeout: Duration) -> Result<(), ConsensusError> {
        self.ensure_running()?;

        let (tx, rx) = oneshot::channel();
        let index = {
            let mut raft = self.state.raft.write().await;
            if raft.can_bootstrap() {
                info!(node = %self.state.id, "no leader yet; electing self to accept join");
                raft.bootstrap();
            }
            let proposed = raft.propose_add_peer(addr);
            self.state.persist(&mut raft)?;
            match proposed? {
                Some((index, term)) => {
                    self.state.register(index, term, tx);
                    index
                }
                None => {
                    debug!(node = %self.state.id, peer = addr, "already a member");
                    return Ok(());
                }
            }
        };
        self.state.replicate.notify_one();

        self.wait_for(index, rx, timeout).await
    }

    async fn wait_for(
        &self,
        index: u64,
        rx: oneshot::Receiver<Result<(), ConsensusError>>,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Shutdown),
            Err(_) => {
                self.state.forget(index);
                Err(ConsensusError::Timeout(timeout))
            }
        }
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.state.raft.read().await.current_leader.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.raft.read().await.is_leader()
    }

    pub async fn status(&self) -> ConsensusStatus {
        let raft = self.state.raft.read().await;
        ConsensusStatus {
            id: raft.id.clone(),
            state: raft.state,
            term: raft.current_term(),
            leader: raft.current_leader.clone(),
            commit_index: raft.commit_index(),
            last_applied: raft.last_applied(),
            snapshot_index: raft.log.snapshot_index(),
            members: raft.members(),
        }
    }

    /// Take a snapshot now, regardless of the threshold. Returns `None` if
    /// nothing was applied since the last one.
    pub async fn snapshot_now(&self) -> Result<Option<SnapshotMeta>, ConsensusError> {
        self.ensure_running()?;
        take_snapshot(&self.state, true).await
    }

    /// Stop ticking and serving peers. Pending callers get `Shutdown`.
    pub async fn shutdown(&self) {
        self.state.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.state.fail_pending(|_| ConsensusError::Shutdown);
        info!(node = %self.state.id, "consensus stopped");
    }
}

impl Drop for Consensus {
    fn drop(&mut self) {
        self.state.shutdown.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Capture, persist and compact. With `force` unset this only runs once
/// enough entries have been applied since the last snapshot.
pub(crate) async fn take_snapshot(
    state: &Arc<ConsensusState>,
    force: bool,
) -> Result<Option<SnapshotMeta>, ConsensusError> {
    let _serial = state.snapshot_lock.lock().await;

    let (snapshot, index, term, members) = {
        let _gate = state.apply_gate.lock().await;
        let raft = state.raft.read().await;
        if !force && !raft.should_snapshot(state.snapshot_threshold) {
            return Ok(None);
        }
        let Some((index, term)) = raft.snapshot_point() else {
            return Ok(None);
        };
        if index <= raft.log.snapshot_index() {
            return Ok(None);
        }
        let members = raft.membership_at(index);
        drop(raft);
        (state.fsm.snapshot()?, index, term, members)
    };

    let store = state.snapshots.clone();
    let persisted = tokio::task::spawn_blocking(move || -> Result<SnapshotMeta, ConsensusError> {
        let mut snapshot = snapshot;
        let mut sink = store.create(index, term, members)?;
        let result = snapshot.persist(&mut sink);
        snapshot.release();
        match result {
            Ok(()) => Ok(sink.close()?),
            Err(e) => {
                if let Err(cancel) = sink.cancel() {
                    warn!(error = %cancel, "failed to clean up cancelled snapshot");
                }
                Err(e.into())
            }
        }
    })
    .await
    .map_err(|e| ConsensusError::Io(std::io::Error::other(e)))??;

    {
        let mut raft = state.raft.write().await;
        raft.compact(persisted.index, persisted.term, persisted.members.clone());
        state.persist(&mut raft)?;
    }

    info!(
        node = %state.id,
        snapshot = %persisted.id,
        index = persisted.index,
        size = persisted.size,
        "snapshot taken"
    );
    Ok(Some(persisted))
}
