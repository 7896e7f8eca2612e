//! Durable Raft state under `<data_dir>/raft`.
//!
//! `log.wal` is a write-ahead log of length-prefixed MessagePack records
//! describing every change to the Raft log. `hard_state.json` holds the
//! current term and vote. Both are synced before a write returns.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RaftStorageError;
use crate::raft::log::{LogEntry, RaftLog};
use crate::raft::node::RaftNode;

const RAFT_DIR: &str = "raft";
const LOG_FILE: &str = "log.wal";
const HARD_STATE_FILE: &str = "hard_state.json";

/// One change to the Raft log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalRecord {
    Append(LogEntry),
    TruncateAfter(u64),
    /// Entries up to `index` were folded into a snapshot.
    Compact { index: u64, term: u64 },
    /// The log was replaced by an empty one starting after a snapshot.
    Reset { index: u64, term: u64 },
}

/// Term and vote. Must survive a restart so a node never votes twice in
/// the same term.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

/// What was read back when the log was opened.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub hard_state: HardState,
    pub log: RaftLog,
}

pub struct RaftWal {
    dir: PathBuf,
    file: File,
    hard_state: HardState,
}

impl RaftWal {
    /// Open the log under `data_dir`, replaying whatever it holds. A record
    /// cut short by a crash ends the log and is cut off the file.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<(Self, Recovered), RaftStorageError> {
        let dir = data_dir.as_ref().join(RAFT_DIR);
        fs::create_dir_all(&dir)?;

        let hard_state = read_hard_state(&dir.join(HARD_STATE_FILE))?;

        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (records, valid_len) = read_records(&file)?;
        if valid_len < file.metadata()?.len() {
            warn!(path = %path.display(), valid_len, "dropping torn record at end of raft log");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let mut log = RaftLog::new();
        let count = records.len();
        for record in records {
            if !log.apply_record(record) {
                warn!(path = %path.display(), "raft log record out of sequence; ignoring the rest");
                break;
            }
        }
        log.take_changes();
        debug!(records = count, last_index = log.last_index(), "replayed raft log");

        let wal = Self {
            dir,
            file,
            hard_state: hard_state.clone(),
        };
        Ok((wal, Recovered { hard_state, log }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    /// Write `hard_state` if it changed.
    pub fn save_hard_state(&mut self, hard_state: &HardState) -> Result<(), RaftStorageError> {
        if *hard_state == self.hard_state {
            return Ok(());
        }
        let path = self.dir.join(HARD_STATE_FILE);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(hard_state)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.hard_state = hard_state.clone();
        Ok(())
    }

    /// Append `records` to the end of the log.
    pub fn append(&mut self, records: &[WalRecord]) -> Result<(), RaftStorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            encode_record(&mut buf, record)?;
        }
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Replace the file with the minimal record set for `log`.
    pub fn rewrite(&mut self, log: &RaftLog) -> Result<(), RaftStorageError> {
        let path = self.dir.join(LOG_FILE);
        let tmp = path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let mut buf = Vec::new();
            encode_record(
                &mut buf,
                &WalRecord::Reset {
                    index: log.snapshot_index(),
                    term: log.snapshot_term(),
                },
            )?;
            for entry in log.entries() {
                encode_record(&mut buf, &WalRecord::Append(entry.clone()))?;
            }
            writer.write_all(&buf)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&path)?;
        debug!(entries = log.len(), "rewrote raft log");
        Ok(())
    }

    /// Make `node`'s term, vote and pending log changes durable.
    pub fn sync(&mut self, node: &mut RaftNode) -> Result<(), RaftStorageError> {
        self.save_hard_state(&node.hard_state())?;

        let changes = node.log.take_changes();
        let compacted = changes
            .iter()
            .any(|r| matches!(r, WalRecord::Compact { .. } | WalRecord::Reset { .. }));
        if compacted {
            self.rewrite(&node.log)
        } else {
            self.append(&changes)
        }
    }
}

fn read_hard_state(path: &Path) -> Result<HardState, RaftStorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HardState::default()),
        Err(e) => Err(e.into()),
    }
}

fn encode_record(buf: &mut Vec<u8>, record: &WalRecord) -> Result<(), RaftStorageError> {
    let data = rmp_serde::to_vec(record)?;
    // Length prefix (4 bytes, big-endian)
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&data);
    Ok(())
}

/// Every complete record in `file`, plus the byte length they cover.
fn read_records(file: &File) -> Result<(Vec<WalRecord>, u64), RaftStorageError> {
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0u64;
    let mut len_buf = [0u8; 4];

    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        records.push(rmp_serde::from_slice(&data)?);
        valid_len += 4 + len as u64;
    }
    Ok((records, valid_len))
}
