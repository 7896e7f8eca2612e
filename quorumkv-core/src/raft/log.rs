use std::cmp::min;
use serde::{Deserialize, Serialize};

use crate::raft::wal::WalRecord;

/// What a log entry carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryPayload {
    /// Opaque bytes handed to the state machine on commit.
    Command(Vec<u8>),
    /// The full voter set, leader included, effective once appended.
    Membership(Vec<String>),
    /// Appended by a fresh leader to commit entries from earlier terms.
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: u64, index: u64, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn noop(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Noop,
        }
    }
}

/// In-memory Raft log.
///
/// Entries up to `snapshot_index` have been compacted into a snapshot; only
/// their boundary (index and term) is remembered. Every mutation is also
/// queued as a [`WalRecord`] until [`take_changes`](Self::take_changes)
/// hands it to the write-ahead log.
#[derive(Debug, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    last_index: u64,
    last_term: u64,
    changes: Vec<WalRecord>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            last_index: 0,
            last_term: 0,
            changes: Vec::new(),
        }
    }

    fn position(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index || index > self.last_index {
            return None;
        }
        Some((index - self.snapshot_index - 1) as usize)
    }

    pub fn append(&mut self, term: u64, payload: EntryPayload) -> u64 {
        let index = self.last_index + 1;
        self.push(LogEntry::new(term, index, payload));
        index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.position(index).and_then(|pos| self.entries.get(pos))
    }

    /// Term of the entry at `index`. The snapshot boundary is still known;
    /// anything before it is not.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries in `start_index..=end_index` that are still held in memory.
    pub fn get_range(&self, start_index: u64, end_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.first_index());
        if start > self.last_index || start > end_index {
            return Vec::new();
        }
        let from = (start - self.snapshot_index - 1) as usize;
        let to = min((end_index - self.snapshot_index) as usize, self.entries.len());
        self.entries[from..to].to_vec()
    }

    pub fn get_from(&self, start_index: u64) -> Vec<LogEntry> {
        self.get_range(start_index, self.last_index)
    }

    /// First index still held in memory.
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn is_up_to_date(&self, candidate_last_term: u64, candidate_last_index: u64) -> bool {
        if candidate_last_term != self.last_term {
            return candidate_last_term >= self.last_term;
        }
        candidate_last_index >= self.last_index
    }

    pub fn matches(&self, prev_log_index: u64, prev_log_term: u64) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        // Compacted entries are committed, so they match any leader's log.
        if prev_log_index < self.snapshot_index {
            return true;
        }
        match self.term_at(prev_log_index) {
            Some(term) => term == prev_log_term,
            None => false,
        }
    }

    /// Drops every entry after `index`. Compacted entries are never dropped.
    pub fn truncate_after(&mut self, index: u64) {
        if index >= self.last_index {
            return;
        }
        let index = index.max(self.snapshot_index);
        self.changes.push(WalRecord::TruncateAfter(index));
        self.entries.truncate((index - self.snapshot_index) as usize);
        self.last_index = index;
        self.last_term = self
            .entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term);
    }

    /// Consistency check plus append. Returns false if the log does not
    /// contain an entry at `prev_log_index` with `prev_log_term`.
    pub fn handle_append_entries(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
    ) -> bool {
        if !self.matches(prev_log_index, prev_log_term) {
            return false;
        }
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    self.truncate_after(entry.index - 1);
                    self.push(entry);
                }
                None => self.push(entry),
            }
        }
        true
    }

    fn push(&mut self, entry: LogEntry) {
        self.last_index = entry.index;
        self.last_term = entry.term;
        self.changes.push(WalRecord::Append(entry.clone()));
        self.entries.push(entry);
    }

    /// Discards entries up to and including `index`, which must already be
    /// captured by a snapshot taken at (`index`, `term`).
    pub fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.snapshot_index {
            return;
        }
        if index >= self.last_index {
            self.reset_to_snapshot(index, term);
            return;
        }
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.changes.push(WalRecord::Compact { index, term });
    }

    /// Replaces the whole log with an empty one starting after a snapshot.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.last_index = index;
        self.last_term = term;
        self.changes.push(WalRecord::Reset { index, term });
    }

    /// Replays one record read back from the write-ahead log. Returns false
    /// if an appended entry does not continue the log.
    pub fn apply_record(&mut self, record: WalRecord) -> bool {
        match record {
            WalRecord::Append(entry) => {
                if entry.index <= self.snapshot_index {
                    return true;
                }
                if entry.index <= self.last_index {
                    self.truncate_after(entry.index - 1);
                }
                if entry.index != self.last_index + 1 {
                    return false;
                }
                self.push(entry);
            }
            WalRecord::TruncateAfter(index) => self.truncate_after(index),
            WalRecord::Compact { index, term } => self.compact_to(index, term),
            WalRecord::Reset { index, term } => self.reset_to_snapshot(index, term),
        }
        true
    }

    /// Mutations since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<WalRecord> {
        std::mem::take(&mut self.changes)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
