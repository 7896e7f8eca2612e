//! Finite state machine bridging the replicated log and the local store.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use tracing::{debug, error};

use crate::command::Command;
use crate::error::{FsmError, StoreError};
use crate::raft::snapshot::SnapshotSink;
use crate::raft::state_machine::{StateMachine, StateMachineSnapshot};
use crate::storage::{LocalStore, SharedStore};

/// Applies committed [`Command`]s to a [`SharedStore`]. It is the only
/// writer of that store.
#[derive(Clone)]
pub struct KvStateMachine {
    store: SharedStore,
}

impl KvStateMachine {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, index: u64, data: &[u8]) -> Result<(), FsmError> {
        let command = Command::decode(data).map_err(|e| {
            error!(index, error = %e, "committed entry does not decode");
            e
        })?;

        let store = self.store.write();
        match &command {
            Command::Set { key, value } => store.set(key.as_bytes(), value.as_bytes())?,
            Command::Delete { key } => store.delete(key.as_bytes())?,
        }
        debug!(index, op = command.name(), key = command.key(), "applied");
        Ok(())
    }

    fn snapshot(&self) -> Result<Box<dyn StateMachineSnapshot>, FsmError> {
        let pairs = self.store.read().scan()?;
        let mut state = BTreeMap::new();
        for (key, value) in pairs {
            state.insert(into_string(key)?, into_string(value)?);
        }
        Ok(Box::new(KvSnapshot { state }))
    }

    fn restore(&self, source: &mut dyn Read) -> Result<(), FsmError> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        let state: BTreeMap<String, String> = rmp_serde::from_slice(&bytes)?;

        let store = self.store.write();
        for (key, _) in store.scan()? {
            let stale = std::str::from_utf8(&key)
                .map(|k| !state.contains_key(k))
                .unwrap_or(true);
            if stale {
                store.delete(&key)?;
            }
        }
        for (key, value) in &state {
            store.set(key.as_bytes(), value.as_bytes())?;
        }
        debug!(keys = state.len(), "restored snapshot");
        Ok(())
    }
}

fn into_string(bytes: Vec<u8>) -> Result<String, FsmError> {
    String::from_utf8(bytes)
        .map_err(|_| FsmError::Store(StoreError::InvalidUtf8("stored entry")))
}

/// The full key space at one point in time, ordered by key.
pub struct KvSnapshot {
    state: BTreeMap<String, String>,
}

impl KvSnapshot {
    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

impl StateMachineSnapshot for KvSnapshot {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), FsmError> {
        let bytes = rmp_serde::to_vec(&self.state)?;
        sink.write_all(&bytes)?;
        Ok(())
    }
}
