use std::{
    fs::File,
    path::{Path, PathBuf},
};

use memmap2::MmapMut;
use tracing::warn;

use super::entry::{ENT_WIDTH, OFF_WIDTH, POS_WIDTH};
use crate::error::{StorageError, StorageResult};

/// Memory-mapped table from relative offset to store position.
///
/// The backing file is grown to `max_bytes` while open and cut back to its
/// logical length on close. Entry `r` lives at byte `r * ENT_WIDTH`.
pub struct Index {
    path: PathBuf,
    file: File,
    mmap: Option<MmapMut>,
    size: u64,
    closed: bool,
}

impl Index {
    pub fn new(path: impl AsRef<Path>, file: File, max_bytes: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file_len = file.metadata()?.len();
        let mapped_len = max_bytes.max(file_len);

        file.set_len(mapped_len).map_err(|e| {
            warn!("Failed to grow index {:?} to {}: {}", path, mapped_len, e);
            e
        })?;

        let mmap = if mapped_len > 0 {
            // SAFETY: the segment owns the index file exclusively for its lifetime.
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };

        let mut index = Self {
            path,
            file,
            mmap,
            size: 0,
            closed: false,
        };
        index.size = index.recover_size(file_len);
        Ok(index)
    }

    /// Counts the real entries in the first `file_len` bytes. A file left
    /// pre-sized by an unclean shutdown is zero padded past the last entry, and
    /// real entries always satisfy `relative_offset == slot`.
    fn recover_size(&self, file_len: u64) -> u64 {
        let Some(mmap) = self.mmap.as_ref() else {
            return 0;
        };
        let slots = file_len.min(mmap.len() as u64) / ENT_WIDTH;
        let mut entries = 0;
        while entries < slots {
            let (rel, _) = Self::decode(mmap, entries);
            if u64::from(rel) != entries {
                break;
            }
            entries += 1;
        }
        entries * ENT_WIDTH
    }

    fn decode(mmap: &MmapMut, slot: u64) -> (u32, u64) {
        let at = (slot * ENT_WIDTH) as usize;
        let mut off = [0u8; OFF_WIDTH as usize];
        let mut pos = [0u8; POS_WIDTH as usize];
        off.copy_from_slice(&mmap[at..at + OFF_WIDTH as usize]);
        pos.copy_from_slice(&mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]);
        (u32::from_be_bytes(off), u64::from_be_bytes(pos))
    }

    /// Returns `(relative_offset, position)`; `-1` reads the last entry.
    pub fn read(&self, rel: i64) -> StorageResult<(u32, u64)> {
        let mmap = self.mmap.as_ref().ok_or(StorageError::IndexEof)?;
        let entries = self.entries();
        if entries == 0 {
            return Err(StorageError::IndexEof);
        }
        let slot = match rel {
            -1 => entries - 1,
            r if r < 0 => return Err(StorageError::IndexEof),
            r => r as u64,
        };
        if slot >= entries {
            return Err(StorageError::IndexEof);
        }
        Ok(Self::decode(mmap, slot))
    }

    pub fn write(&mut self, rel: u32, pos: u64) -> StorageResult<()> {
        if self.is_full() {
            return Err(StorageError::IndexFull);
        }
        let mmap = self.mmap.as_mut().ok_or(StorageError::IndexFull)?;
        let at = self.size as usize;
        mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&rel.to_be_bytes());
        mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize].copy_from_slice(&pos.to_be_bytes());
        self.size += ENT_WIDTH;
        Ok(())
    }

    /// True when one more entry would not fit.
    pub fn is_full(&self) -> bool {
        let cap = self.mmap.as_ref().map_or(0, |m| m.len() as u64);
        self.size + ENT_WIDTH > cap
    }

    /// Keeps the first `entries` entries and zeroes the rest so crash
    /// recovery cannot resurrect them.
    pub fn truncate(&mut self, entries: u64) -> StorageResult<()> {
        let new_size = entries * ENT_WIDTH;
        if new_size >= self.size {
            return Ok(());
        }
        if let Some(mmap) = self.mmap.as_mut() {
            mmap[new_size as usize..self.size as usize].fill(0);
            mmap.flush()?;
        }
        self.size = new_size;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.size / ENT_WIDTH
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> StorageResult<()> {
        if let Some(mmap) = self.mmap.as_ref() {
            mmap.flush()?;
        }
        Ok(())
    }

    /// Flushes the map, then trims the file to its logical length.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(mmap) = self.mmap.take() {
            mmap.flush().map_err(|e| {
                warn!("Failed to flush index {:?}: {}", self.path, e);
                e
            })?;
        }
        self.file.set_len(self.size)?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close index {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(path: &Path, max_bytes: u64) -> Index {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap();
        Index::new(path, file, max_bytes).unwrap()
    }

    #[test]
    fn test_index_read_write() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.index");
        let mut index = open(&path, 1024);

        assert!(matches!(index.read(-1), Err(StorageError::IndexEof)));

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
            assert_eq!(index.read(off as i64).unwrap(), (off, pos));
        }
        assert_eq!(index.read(-1).unwrap(), (1, 10));
        assert!(matches!(index.read(2), Err(StorageError::IndexEof)));

        index.close().unwrap();
        drop(index);

        // the closed file holds exactly the written entries
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENT_WIDTH);
        let index = open(&path, 1024);
        assert_eq!(index.entries(), 2);
        assert_eq!(index.read(-1).unwrap(), (1, 10));
    }

    #[test]
    fn test_index_full() {
        let temp_dir = TempDir::new().unwrap();
        let mut index = open(&temp_dir.path().join("0.index"), ENT_WIDTH * 2);
        index.write(0, 0).unwrap();
        index.write(1, 20).unwrap();
        assert!(index.is_full());
        assert!(matches!(index.write(2, 40), Err(StorageError::IndexFull)));
    }

    #[test]
    fn test_index_ignores_padding_after_unclean_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.index");
        {
            let mut index = open(&path, 1024);
            index.write(0, 0).unwrap();
            index.write(1, 19).unwrap();
            index.write(2, 38).unwrap();
            // simulate a crash: flush the map but skip the trim on close
            index.mmap.as_ref().unwrap().flush().unwrap();
            index.closed = true;
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1024);

        let index = open(&path, 1024);
        assert_eq!(index.entries(), 3);
        assert_eq!(index.read(-1).unwrap(), (2, 38));
    }

    #[test]
    fn test_index_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.index");
        let mut index = open(&path, 1024);
        for i in 0..5u32 {
            index.write(i, u64::from(i) * 10).unwrap();
        }
        index.truncate(2).unwrap();
        assert_eq!(index.entries(), 2);
        assert!(index.read(2).is_err());
        index.write(2, 99).unwrap();
        assert_eq!(index.read(-1).unwrap(), (2, 99));
    }
}
