//! Durable shard-keyed log storage on rocksdb.
//!
//! One keyspace holds every shard's log plus the small per-shard state
//! (applied index, term/vote) and the channel metadata records. Writes
//! go through the WAL with sync enabled, so an append that returns `Ok`
//! is durable.
//!
//! Key layout:
//! `l/<shard>/<index be64>` log entries, `a/<shard>` applied index,
//! `t/<shard>` term state, `m/<slot be32>/<channel key>` channel meta.

use crate::error::{Result, RookeryError};
use crate::replica::{LogEntry, TermState};
use crate::types::{ChannelMeta, LogIndex, SlotId, Term};
use rocksdb::{Direction, IteratorMode, Options as DbOptions, WriteBatch, WriteOptions, DB};
use std::path::Path;

pub struct ShardLogStorage {
    db: DB,
}

impl ShardLogStorage {
    /// Open or create the log DB at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let mut opts = DbOptions::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    /// Flush memtables and the WAL. Called on server stop.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Append entries to a shard's log. The first entry must continue the
    /// log exactly, or the append fails with `OutOfOrder`.
    pub fn append(&self, shard: &str, entries: &[LogEntry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let last = self.last_index(shard)?;
        if first.index != last + 1 {
            return Err(RookeryError::OutOfOrder {
                expected: last + 1,
                got: first.index,
            });
        }

        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put(log_key(shard, entry.index), bincode::serialize(entry)?);
        }
        self.db.write_opt(batch, &sync_writes())?;
        Ok(())
    }

    /// Read entries in `[start, end_exclusive)` up to `max_bytes` of entry
    /// payload, truncated to a whole-entry prefix. At least one entry is
    /// returned when the range is non-empty, so oversized entries still
    /// make progress.
    pub fn read(
        &self,
        shard: &str,
        start: LogIndex,
        end_exclusive: LogIndex,
        max_bytes: u64,
    ) -> Result<Vec<LogEntry>> {
        let prefix = log_prefix(shard);
        let start_key = log_key(shard, start);
        let mut entries = Vec::new();
        let mut total = 0u64;

        let iter = self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let entry: LogEntry = bincode::deserialize(&value)?;
            if entry.index >= end_exclusive {
                break;
            }
            total += value.len() as u64;
            if total > max_bytes && !entries.is_empty() {
                break;
            }
            entries.push(entry);
            if total > max_bytes {
                break;
            }
        }
        Ok(entries)
    }

    /// Highest index stored for a shard, 0 when the log is empty.
    pub fn last_index(&self, shard: &str) -> Result<LogIndex> {
        let prefix = log_prefix(shard);
        let upper = log_key(shard, LogIndex::MAX);
        let mut iter = self
            .db
            .iterator(IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.starts_with(&prefix) {
                    parse_log_index(&prefix, &key)
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    /// Term of the entry at `index`, if stored.
    pub fn term_at(&self, shard: &str, index: LogIndex) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        match self.db.get(log_key(shard, index))? {
            Some(value) => {
                let entry: LogEntry = bincode::deserialize(&value)?;
                Ok(Some(entry.term))
            }
            None => Ok(None),
        }
    }

    /// Delete entries at `from_index` and above. Committed entries are
    /// immutable; the replica only truncates above its commit index.
    pub fn truncate_from(&self, shard: &str, from_index: LogIndex) -> Result<()> {
        let prefix = log_prefix(shard);
        let start_key = log_key(shard, from_index);
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator(IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete(&key);
        }
        self.db.write_opt(batch, &sync_writes())?;
        Ok(())
    }

    pub fn set_applied_index(&self, shard: &str, index: LogIndex) -> Result<()> {
        let mut opts = WriteOptions::default();
        // The applied index trails the WAL-durable log; a lost update is
        // re-derived by replaying applies, so no sync here.
        opts.set_sync(false);
        self.db
            .put_opt(applied_key(shard), index.to_be_bytes(), &opts)?;
        Ok(())
    }

    pub fn applied_index(&self, shard: &str) -> Result<LogIndex> {
        match self.db.get(applied_key(shard))? {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| RookeryError::Corrupt("applied index malformed".into()))?;
                Ok(LogIndex::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    pub fn set_term_state(&self, shard: &str, state: &TermState) -> Result<()> {
        self.db
            .put_opt(term_key(shard), bincode::serialize(state)?, &sync_writes())?;
        Ok(())
    }

    pub fn term_state(&self, shard: &str) -> Result<Option<TermState>> {
        match self.db.get(term_key(shard))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn put_channel_meta(&self, slot: SlotId, meta: &ChannelMeta) -> Result<()> {
        self.db.put_opt(
            meta_key(slot, &meta.key.handler_key()),
            bincode::serialize(meta)?,
            &sync_writes(),
        )?;
        Ok(())
    }

    pub fn channel_meta(&self, slot: SlotId, handler_key: &str) -> Result<Option<ChannelMeta>> {
        match self.db.get(meta_key(slot, handler_key))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

fn sync_writes() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

fn log_prefix(shard: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(shard.len() + 3);
    key.extend_from_slice(b"l/");
    key.extend_from_slice(shard.as_bytes());
    key.push(b'/');
    key
}

fn log_key(shard: &str, index: LogIndex) -> Vec<u8> {
    let mut key = log_prefix(shard);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn parse_log_index(prefix: &[u8], key: &[u8]) -> Result<LogIndex> {
    let bytes: [u8; 8] = key[prefix.len()..]
        .try_into()
        .map_err(|_| RookeryError::Corrupt("log key malformed".into()))?;
    Ok(LogIndex::from_be_bytes(bytes))
}

fn applied_key(shard: &str) -> Vec<u8> {
    [b"a/", shard.as_bytes()].concat()
}

fn term_key(shard: &str) -> Vec<u8> {
    [b"t/", shard.as_bytes()].concat()
}

fn meta_key(slot: SlotId, handler_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(handler_key.len() + 7);
    key.extend_from_slice(b"m/");
    key.extend_from_slice(&slot.to_be_bytes());
    key.push(b'/');
    key.extend_from_slice(handler_key.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelKey;
    use tempfile::tempdir;

    fn entry(term: Term, index: LogIndex, data: Vec<u8>) -> LogEntry {
        LogEntry::new(term, index, index * 10, data)
    }

    #[test]
    fn append_and_read() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        storage
            .append(
                "0",
                &[
                    entry(1, 1, vec![1]),
                    entry(1, 2, vec![2]),
                    entry(2, 3, vec![3]),
                ],
            )
            .unwrap();

        assert_eq!(storage.last_index("0").unwrap(), 3);
        assert_eq!(storage.term_at("0", 2).unwrap(), Some(1));
        assert_eq!(storage.term_at("0", 3).unwrap(), Some(2));
        assert_eq!(storage.term_at("0", 9).unwrap(), None);

        let entries = storage.read("0", 1, 4, u64::MAX).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].data_bytes(), &[3]);
    }

    #[test]
    fn append_rejects_gap() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        storage.append("0", &[entry(1, 1, vec![])]).unwrap();
        let err = storage.append("0", &[entry(1, 5, vec![])]).unwrap_err();
        assert!(matches!(err, RookeryError::OutOfOrder { expected: 2, got: 5 }));
    }

    #[test]
    fn shards_are_isolated() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        storage.append("0", &[entry(1, 1, vec![0])]).unwrap();
        storage
            .append("room-1#1", &[entry(1, 1, vec![1]), entry(1, 2, vec![2])])
            .unwrap();

        assert_eq!(storage.last_index("0").unwrap(), 1);
        assert_eq!(storage.last_index("room-1#1").unwrap(), 2);
        assert_eq!(storage.last_index("other").unwrap(), 0);
    }

    #[test]
    fn read_respects_max_bytes() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        storage
            .append(
                "0",
                &[
                    entry(1, 1, vec![0; 100]),
                    entry(1, 2, vec![0; 100]),
                    entry(1, 3, vec![0; 100]),
                ],
            )
            .unwrap();

        let entries = storage.read("0", 1, 4, 150).unwrap();
        assert_eq!(entries.len(), 1);

        // Oversized first entry still returns one entry.
        let entries = storage.read("0", 1, 4, 1).unwrap();
        assert_eq!(entries.len(), 1);

        // The next round starts after the returned prefix.
        let entries = storage.read("0", 2, 4, u64::MAX).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn truncate() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        storage
            .append(
                "0",
                &[entry(1, 1, vec![]), entry(1, 2, vec![]), entry(1, 3, vec![])],
            )
            .unwrap();
        storage.truncate_from("0", 2).unwrap();
        assert_eq!(storage.last_index("0").unwrap(), 1);

        // Appends continue from the truncation point.
        storage.append("0", &[entry(2, 2, vec![])]).unwrap();
        assert_eq!(storage.term_at("0", 2).unwrap(), Some(2));
    }

    #[test]
    fn applied_index_round_trip() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        assert_eq!(storage.applied_index("0").unwrap(), 0);
        storage.set_applied_index("0", 42).unwrap();
        assert_eq!(storage.applied_index("0").unwrap(), 42);
    }

    #[test]
    fn term_state_round_trip() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        assert!(storage.term_state("0").unwrap().is_none());
        storage
            .set_term_state(
                "0",
                &TermState {
                    current_term: 7,
                    voted_for: Some(3),
                },
            )
            .unwrap();
        let state = storage.term_state("0").unwrap().unwrap();
        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for, Some(3));
    }

    #[test]
    fn channel_meta_round_trip() {
        let dir = tempdir().unwrap();
        let storage = ShardLogStorage::open(dir.path()).unwrap();

        let meta = ChannelMeta {
            key: ChannelKey::new("room-42", 1),
            replicas: vec![1, 2, 3],
            leader: 1,
            term: 2,
        };
        storage.put_channel_meta(5, &meta).unwrap();
        let loaded = storage.channel_meta(5, "room-42#1").unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(storage.channel_meta(5, "missing#0").unwrap().is_none());
    }
}
