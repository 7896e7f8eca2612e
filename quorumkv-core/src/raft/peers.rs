use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RaftStorageError;

const PEERS_FILE: &str = "peers.json";

/// Known cluster members, kept as a JSON array in `<data_dir>/peers.json`.
#[derive(Debug, Clone)]
pub struct JsonPeers {
    path: PathBuf,
}

impl JsonPeers {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(PEERS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored members; empty if nothing was ever stored.
    pub fn peers(&self) -> Result<Vec<String>, RaftStorageError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_peers(&self, peers: &[String]) -> Result<(), RaftStorageError> {
        let bytes = serde_json::to_vec(peers)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
