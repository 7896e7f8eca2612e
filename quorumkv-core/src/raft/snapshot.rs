//! On-disk snapshot store.
//!
//! Each snapshot lives in its own directory under `<data_dir>/snapshots`,
//! named `<term>-<index>-<millis>`, holding `meta.json` and `state.bin`.
//! A snapshot is written into a `.tmp` directory and renamed into place on
//! close, so a crash never leaves a half-written snapshot visible.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RaftStorageError;

const SNAPSHOT_DIR: &str = "snapshots";
const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Describes a persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub id: String,
    /// Last log index covered.
    pub index: u64,
    pub term: u64,
    /// Voter set as of `index`.
    pub members: Vec<String>,
    /// Size of the state blob in bytes.
    pub size: u64,
}

/// Destination for a state machine snapshot.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;
}

/// Snapshot store rooted at `<data_dir>/snapshots`, keeping the newest
/// `retain` snapshots.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub fn open(data_dir: impl AsRef<Path>, retain: usize) -> Result<Self, RaftStorageError> {
        let dir = data_dir.as_ref().join(SNAPSHOT_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start writing a new snapshot.
    pub fn create(
        &self,
        index: u64,
        term: u64,
        members: Vec<String>,
    ) -> Result<FileSnapshotSink, RaftStorageError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let id = format!("{term}-{index}-{millis}");
        let tmp_dir = self.dir.join(format!("{id}{TMP_SUFFIX}"));
        fs::create_dir_all(&tmp_dir)?;
        let file = File::create(tmp_dir.join(STATE_FILE))?;

        Ok(FileSnapshotSink {
            store: self.clone(),
            meta: SnapshotMeta {
                id,
                index,
                term,
                members,
                size: 0,
            },
            tmp_dir,
            writer: BufWriter::new(file),
        })
    }

    /// Every complete snapshot, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>, RaftStorageError> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(TMP_SUFFIX) || !entry.file_type()?.is_dir() {
                continue;
            }
            match self.read_meta(&entry.path()) {
                Ok(meta) => metas.push(meta),
                Err(e) => warn!(snapshot = %name, error = %e, "skipping unreadable snapshot"),
            }
        }
        metas.sort_by(|a, b| {
            (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id))
        });
        Ok(metas)
    }

    pub fn latest(&self) -> Result<Option<SnapshotMeta>, RaftStorageError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Metadata and state blob of the snapshot `id`.
    pub fn read(&self, id: &str) -> Result<(SnapshotMeta, Vec<u8>), RaftStorageError> {
        let path = self.dir.join(id);
        if !path.is_dir() {
            return Err(RaftStorageError::SnapshotNotFound(id.to_string()));
        }
        let meta = self.read_meta(&path)?;
        let mut data = Vec::with_capacity(meta.size as usize);
        File::open(path.join(STATE_FILE))?.read_to_end(&mut data)?;
        Ok((meta, data))
    }

    fn read_meta(&self, path: &Path) -> Result<SnapshotMeta, RaftStorageError> {
        let bytes = fs::read(path.join(META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Remove everything beyond the newest `retain` snapshots.
    fn reap(&self) -> Result<(), RaftStorageError> {
        for meta in self.list()?.into_iter().skip(self.retain) {
            debug!(snapshot = %meta.id, "removing old snapshot");
            fs::remove_dir_all(self.dir.join(&meta.id))?;
        }
        Ok(())
    }
}

/// A snapshot being written. Call [`close`](Self::close) to publish it or
/// [`cancel`](Self::cancel) to throw it away.
pub struct FileSnapshotSink {
    store: FileSnapshotStore,
    meta: SnapshotMeta,
    tmp_dir: PathBuf,
    writer: BufWriter<File>,
}

impl FileSnapshotSink {
    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    pub fn close(mut self) -> Result<SnapshotMeta, RaftStorageError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let meta_bytes = serde_json::to_vec_pretty(&self.meta)?;
        fs::write(self.tmp_dir.join(META_FILE), meta_bytes)?;

        let final_dir = self.store.dir.join(&self.meta.id);
        fs::rename(&self.tmp_dir, &final_dir)?;
        self.store.reap()?;

        debug!(
            snapshot = %self.meta.id,
            index = self.meta.index,
            size = self.meta.size,
            "snapshot persisted"
        );
        Ok(self.meta)
    }

    pub fn cancel(self) -> Result<(), RaftStorageError> {
        drop(self.writer);
        fs::remove_dir_all(&self.tmp_dir)?;
        Ok(())
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.meta.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }
}
