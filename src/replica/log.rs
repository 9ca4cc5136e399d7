//! In-memory tail of a shard's replicated log.
//!
//! The durable log lives in [`crate::storage::ShardLogStorage`]; the tail
//! kept here serves the hot paths (append, match checks, sync fill).
//! Lookups below `first_index` fall back to storage in the replica driver.

use crate::error::{Result, RookeryError};
use crate::types::{LogIndex, Term};

use super::message::LogEntry;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct ShardLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first entry held in memory.
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, for match checks at the
    /// in-memory boundary.
    base_term: Term,
}

impl ShardLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            base_term: 0,
        }
    }

    /// Rebuild a tail starting at `first_index` with the given boundary term.
    pub fn with_base(first_index: LogIndex, base_term: Term) -> Self {
        Self {
            entries: VecDeque::new(),
            first_index,
            base_term,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.base_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one entry; its index must be exactly `last_index() + 1`.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RookeryError::OutOfOrder {
                expected,
                got: entry.index,
            });
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term at `index`, if the position is covered by the in-memory tail.
    /// Index 0 is the empty-log sentinel with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index + 1 == self.first_index {
            return Some(self.base_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `limit` entries starting at `start`.
    pub fn entries_from_limit(&self, start: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start > self.last_index() || limit == 0 {
            return Vec::new();
        }
        let start = start.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Entries in `(from, to]`, bounded by `limit`.
    pub fn entries_range_limit(&self, from: LogIndex, to: LogIndex, limit: usize) -> Vec<LogEntry> {
        self.entries_from_limit(from + 1, limit)
            .into_iter()
            .take_while(|e| e.index <= to)
            .collect()
    }

    /// Drop every entry at `index` and above. Only un-committed positions
    /// may be truncated; the caller enforces that.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Log-matching check against the leader's `(prev_index, prev_term)`.
    /// `None` means the position is older than the in-memory tail and the
    /// caller must consult storage.
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> Option<bool> {
        if prev_index == 0 {
            return Some(true);
        }
        if prev_index > self.last_index() {
            return Some(false);
        }
        self.term_at(prev_index).map(|t| t == prev_term)
    }

    /// Whether a candidate at `(last_log_index, last_log_term)` is at least
    /// as up-to-date as this log. Vote tie-break rule.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// Look up an un-applied entry by its log id. Used to dedup re-submitted
    /// proposes.
    pub fn find_by_id(&self, id: u64) -> Option<LogIndex> {
        self.entries.iter().rev().find(|e| e.id == id).map(|e| e.index)
    }
}

impl Default for ShardLog {
    fn default() -> Self {
        Self::new()
    }
}
