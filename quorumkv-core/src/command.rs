//! Commands replicated through the Raft log.
//!
//! A command is the unit of replication and of atomicity. The encoding is
//! JSON with an `op` tag, e.g. `{"op":"set","key":"k","value":"v"}`, and is
//! used both for log payloads and for forwarded requests.

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// A key-space mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        serde_json::to_vec(self).map_err(CommandError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CommandError> {
        serde_json::from_slice(data).map_err(CommandError::Decode)
    }
}
