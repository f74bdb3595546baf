//! Consensus log on top of the segmented [`Log`].
//!
//! Each entry is stored as a record whose offset equals the entry index. The
//! private log starts at offset 1 so index 0 stays reserved for "nothing".

use std::path::Path;

use async_trait::async_trait;
use tracing::{Span, debug, warn};

use super::log::Log;
use crate::config::SegmentConfig;
use crate::error::{StorageError, StorageResult};
use crate::raft::{LogEntry, LogEntryStorage};
use crate::types::Record;

pub struct RaftLogStore {
    log: Log,
    span: Span,
}

impl RaftLogStore {
    pub fn new(dir: impl AsRef<Path>, config: SegmentConfig, span: Span) -> StorageResult<Self> {
        let log = Log::new(dir, config.with_initial_offset(1), span.clone())?;
        Ok(Self { log, span })
    }

    pub fn first_index(&self) -> u64 {
        self.log.lowest_offset()
    }

    /// Index of the newest entry, `first_index() - 1` when empty.
    pub fn last_index(&self) -> u64 {
        self.log.next_offset() - 1
    }

    pub fn get_log(&self, index: u64) -> StorageResult<LogEntry> {
        let record = self.log.read(index)?;
        let (entry, _) = LogEntry::deserialize(&record.value)?;
        if entry.index != index {
            return Err(StorageError::Corrupted(format!(
                "entry at offset {} claims index {}",
                index, entry.index
            )));
        }
        Ok(entry)
    }

    pub fn store_log(&self, entry: &LogEntry) -> StorageResult<()> {
        let next = self.log.next_offset();
        if entry.index != next {
            warn!(
                parent: &self.span,
                "Refusing entry {} while the log expects {}",
                entry.index,
                next
            );
            return Err(StorageError::Consistency(format!(
                "entry index {} does not follow last index {}",
                entry.index,
                next - 1
            )));
        }
        self.log.append(Record::new(entry.serialize()?))?;
        Ok(())
    }

    /// Appends `entries` and makes them durable before returning.
    pub fn store_logs(&self, entries: &[LogEntry]) -> StorageResult<()> {
        entries.iter().try_for_each(|entry| self.store_log(entry))?;
        self.log.flush()
    }

    /// Deletes `[min, max]`: either a prefix, which keeps segments that
    /// straddle `max`, or a suffix.
    pub fn delete_range(&self, min: u64, max: u64) -> StorageResult<()> {
        if min > max {
            return Ok(());
        }
        let first = self.first_index();
        let last = self.last_index();
        debug!(parent: &self.span, "Deleting entries [{}, {}] of [{}, {}]", min, max, first, last);

        if min <= first {
            if max >= last {
                self.log.reset(max + 1)
            } else {
                self.log.truncate(max + 1)
            }
        } else if max >= last {
            self.log.truncate_suffix(min)
        } else {
            Err(StorageError::Consistency(format!(
                "cannot delete [{}, {}] from the middle of [{}, {}]",
                min, max, first, last
            )))
        }
    }

    pub fn reset(&self, next_index: u64) -> StorageResult<()> {
        self.log.reset(next_index)
    }

    pub fn close(&self) -> StorageResult<()> {
        self.log.close()
    }
}

#[async_trait]
impl LogEntryStorage for RaftLogStore {
    async fn first_index(&self) -> StorageResult<u64> {
        Ok(RaftLogStore::first_index(self))
    }

    async fn last_index(&self) -> StorageResult<u64> {
        Ok(RaftLogStore::last_index(self))
    }

    async fn get_log(&self, index: u64) -> StorageResult<LogEntry> {
        RaftLogStore::get_log(self, index)
    }

    async fn store_logs(&self, entries: &[LogEntry]) -> StorageResult<()> {
        RaftLogStore::store_logs(self, entries)
    }

    async fn delete_range(&self, min: u64, max: u64) -> StorageResult<()> {
        RaftLogStore::delete_range(self, min, max)
    }

    async fn reset(&self, next_index: u64) -> StorageResult<()> {
        RaftLogStore::reset(self, next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryPayload;
    use tempfile::TempDir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: EntryPayload::Command(format!("cmd-{}", index).into_bytes()),
        }
    }

    fn open(dir: &TempDir) -> RaftLogStore {
        let config = SegmentConfig {
            max_store_bytes: 64,
            ..Default::default()
        };
        RaftLogStore::new(dir.path(), config, Span::none()).unwrap()
    }

    #[test]
    fn test_indices_start_at_one() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 0);

        store.store_logs(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();
        assert_eq!(store.last_index(), 3);
        assert_eq!(store.get_log(3).unwrap(), entry(2, 3));
        assert!(matches!(store.get_log(0), Err(StorageError::OffsetOutOfRange(0))));
    }

    #[test]
    fn test_stored_entries_survive_crash() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        let entries: Vec<_> = (1..=6).map(|i| entry(1, i)).collect();
        store.store_logs(&entries).unwrap();
        assert_eq!(store.last_index(), 6);
        // 跳过析构，相当于进程被杀
        std::mem::forget(store);

        let store = open(&temp_dir);
        assert_eq!(store.first_index(), 1);
        assert_eq!(store.last_index(), 6);
        for want in &entries {
            assert_eq!(&store.get_log(want.index).unwrap(), want);
        }
    }

    #[test]
    fn test_store_rejects_gaps() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        store.store_log(&entry(1, 1)).unwrap();
        assert!(matches!(store.store_log(&entry(1, 3)), Err(StorageError::Consistency(_))));
        assert!(matches!(store.store_log(&entry(1, 1)), Err(StorageError::Consistency(_))));
    }

    #[test]
    fn test_delete_suffix_then_rewrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        for i in 1..=10 {
            store.store_log(&entry(1, i)).unwrap();
        }
        store.delete_range(6, 10).unwrap();
        assert_eq!(store.last_index(), 5);
        store.store_log(&entry(2, 6)).unwrap();
        assert_eq!(store.get_log(6).unwrap().term, 2);
    }

    #[test]
    fn test_delete_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        for i in 1..=20 {
            store.store_log(&entry(1, i)).unwrap();
        }
        store.delete_range(1, 12).unwrap();
        let first = store.first_index();
        assert!(first > 1 && first <= 13);
        assert_eq!(store.last_index(), 20);
        assert_eq!(store.get_log(13).unwrap(), entry(1, 13));
    }

    #[test]
    fn test_delete_everything_moves_first_index() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        for i in 1..=4 {
            store.store_log(&entry(1, i)).unwrap();
        }
        store.delete_range(1, 4).unwrap();
        assert_eq!(store.first_index(), 5);
        assert_eq!(store.last_index(), 4);
        store.store_log(&entry(3, 5)).unwrap();
        assert_eq!(store.get_log(5).unwrap().term, 3);
    }

    #[test]
    fn test_delete_middle_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        for i in 1..=6 {
            store.store_log(&entry(1, i)).unwrap();
        }
        assert!(matches!(store.delete_range(2, 4), Err(StorageError::Consistency(_))));
    }
}
