use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use super::entry::{INDEX_FILE_SUFFIX, LEN_WIDTH, STORE_FILE_SUFFIX};
use super::index::Index;
use super::store::Store;
use crate::config::SegmentConfig;
use crate::error::{StorageError, StorageResult};
use crate::types::Record;

/// One store file and one index file covering `[base_offset, next_offset)`.
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
}

pub(crate) fn segment_path(dir: &Path, base_offset: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{}.{}", base_offset, suffix))
}

impl Segment {
    pub fn new(dir: impl AsRef<Path>, base_offset: u64, config: SegmentConfig) -> StorageResult<Self> {
        let dir = dir.as_ref();
        let store_path = segment_path(dir, base_offset, STORE_FILE_SUFFIX);
        let store_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&store_path)
            .map_err(|e| {
                warn!("Failed to open store file {:?}: {}", store_path, e);
                e
            })?;
        let store = Arc::new(Store::new(&store_path, store_file)?);

        let index_path = segment_path(dir, base_offset, INDEX_FILE_SUFFIX);
        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&index_path)
            .map_err(|e| {
                warn!("Failed to open index file {:?}: {}", index_path, e);
                e
            })?;
        let index = Index::new(&index_path, index_file, config.max_index_bytes)?;

        let mut segment = Self {
            store,
            index,
            base_offset,
            next_offset: base_offset,
            config,
        };
        segment.recover()?;
        segment.next_offset = base_offset + segment.index.entries();
        Ok(segment)
    }

    /// Reconciles index and store after an unclean shutdown: index entries
    /// pointing past the store are dropped, then store bytes past the last
    /// indexed entry are dropped. I/O failures abort the open.
    fn recover(&mut self) -> StorageResult<()> {
        let store_size = self.store.size();
        while self.index.entries() > 0 {
            let (_, pos) = self.index.read(-1)?;
            match self.store.entry_end(pos)? {
                Some(end) => {
                    if end < store_size {
                        debug!(
                            "Dropping {} unindexed bytes from segment {}",
                            store_size - end,
                            self.base_offset
                        );
                        self.store.truncate(end)?;
                    }
                    return Ok(());
                }
                None => {
                    let entries = self.index.entries();
                    warn!(
                        "Segment {} index entry {} points past its store, dropping it",
                        self.base_offset,
                        entries - 1
                    );
                    self.index.truncate(entries - 1)?;
                }
            }
        }
        self.store.truncate(0)
    }

    /// Appends `record` under the next offset and returns that offset.
    pub fn append(&mut self, mut record: Record) -> StorageResult<u64> {
        if self.index.is_full() {
            return Err(StorageError::IndexFull);
        }
        let cur = self.next_offset;
        record.offset = cur;
        let data = record.serialize()?;

        let (_, pos) = self.store.append(&data)?;
        self.index.write((cur - self.base_offset) as u32, pos)?;
        self.next_offset += 1;
        Ok(cur)
    }

    pub fn read(&self, offset: u64) -> StorageResult<Record> {
        if offset < self.base_offset || offset >= self.next_offset {
            return Err(StorageError::OffsetOutOfRange(offset));
        }
        let (_, pos) = self.index.read((offset - self.base_offset) as i64)?;
        let data = self.store.read(pos)?;
        let (record, _) = Record::deserialize(&data)?;
        Ok(record)
    }

    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
            || self.index.is_full()
    }

    /// Drops every record at or after `offset`.
    pub fn truncate_from(&mut self, offset: u64) -> StorageResult<()> {
        if offset >= self.next_offset {
            return Ok(());
        }
        let keep = offset.saturating_sub(self.base_offset);
        let store_size = if keep == 0 {
            0
        } else {
            self.index.read(keep as i64)?.1
        };
        self.index.truncate(keep)?;
        self.store.truncate(store_size)?;
        self.next_offset = self.base_offset + keep;
        Ok(())
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Makes every append so far durable.
    pub fn flush(&self) -> StorageResult<()> {
        self.store.flush()?;
        self.index.flush()
    }

    pub fn close(&mut self) -> StorageResult<()> {
        self.index.close()?;
        self.store.close()
    }

    /// Closes the segment and deletes both files.
    pub fn remove(mut self) -> StorageResult<()> {
        self.close()?;
        fs::remove_file(self.index.path())?;
        fs::remove_file(self.store.path())?;
        Ok(())
    }
}
