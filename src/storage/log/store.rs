use std::{
    fs::File,
    io::{self, BufWriter, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::warn;

use super::entry::LEN_WIDTH;
use crate::error::{StorageError, StorageResult};

struct StoreInner {
    buf: BufWriter<File>,
    size: u64,
}

/// Append-only file of length-prefixed payloads.
///
/// Writes go through a buffer; every read flushes it first so readers always
/// observe what has been appended. Appends are durable only after [`Store::flush`].
pub struct Store {
    path: PathBuf,
    file: File,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Wraps a file opened for reading and appending.
    pub fn new(path: impl AsRef<Path>, file: File) -> StorageResult<Self> {
        let size = file.metadata()?.len();
        let writer = file.try_clone()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            inner: Mutex::new(StoreInner {
                buf: BufWriter::new(writer),
                size,
            }),
        })
    }

    /// Appends one entry and returns `(bytes_written, position)`.
    pub fn append(&self, payload: &[u8]) -> StorageResult<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;
        inner
            .buf
            .write_all(&(payload.len() as u64).to_be_bytes())
            .and_then(|_| inner.buf.write_all(payload))
            .map_err(|e| {
                warn!("Failed to append to store {:?}: {}", self.path, e);
                e
            })?;
        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Reads the payload of the entry starting at `pos`.
    pub fn read(&self, pos: u64) -> StorageResult<Vec<u8>> {
        let size = self.flush_buffer()?;
        if pos + LEN_WIDTH > size {
            return Err(eof(pos, size).into());
        }

        let mut len = [0u8; LEN_WIDTH as usize];
        self.file.read_exact_at(&mut len, pos)?;
        let len = u64::from_be_bytes(len);
        if pos + LEN_WIDTH + len > size {
            return Err(eof(pos, size).into());
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Raw read of up to `limit - off` bytes at `off`.
    pub fn read_at(&self, buf: &mut [u8], off: u64, limit: u64) -> io::Result<usize> {
        let size = self.flush_buffer().map_err(io::Error::other)?.min(limit);
        if off >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - off) as usize);
        self.file.read_at(&mut buf[..want], off)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// End of the entry starting at `pos`, `None` when the store does not
    /// hold all of it.
    pub fn entry_end(&self, pos: u64) -> StorageResult<Option<u64>> {
        let size = self.flush_buffer()?;
        if pos + LEN_WIDTH > size {
            return Ok(None);
        }
        let mut len = [0u8; LEN_WIDTH as usize];
        self.file.read_exact_at(&mut len, pos)?;
        let end = pos + LEN_WIDTH + u64::from_be_bytes(len);
        Ok((end <= size).then_some(end))
    }

    /// Writes buffered appends through to the disk.
    pub fn flush(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.buf.get_ref().sync_data().map_err(|e| {
            warn!("Failed to sync store {:?}: {}", self.path, e);
            StorageError::Io(e)
        })
    }

    /// Drops every byte at or after `size`.
    pub fn truncate(&self, size: u64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        if size < inner.size {
            self.file.set_len(size).map_err(|e| {
                warn!("Failed to truncate store {:?} to {}: {}", self.path, size, e);
                e
            })?;
            inner.size = size;
        }
        Ok(())
    }

    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.buf.get_ref().sync_all().map_err(|e| {
            warn!("Failed to sync store {:?}: {}", self.path, e);
            StorageError::Io(e)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush_buffer(&self) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        Ok(inner.size)
    }
}

fn eof(pos: u64, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("position {} beyond store size {}", pos, size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(path: &Path) -> Store {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        Store::new(path, file).unwrap()
    }

    #[test]
    fn test_store_append_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.store");
        let store = open(&path);

        let payload = b"hello world";
        let width = LEN_WIDTH + payload.len() as u64;
        for i in 0..3u64 {
            let (n, pos) = store.append(payload).unwrap();
            assert_eq!(n, width);
            assert_eq!(pos, i * width);
        }
        for i in 0..3u64 {
            assert_eq!(store.read(i * width).unwrap(), payload);
        }
        assert!(store.read(3 * width).is_err());
    }

    #[test]
    fn test_store_reopen_keeps_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.store");
        {
            let store = open(&path);
            store.append(b"first").unwrap();
            store.append(b"second").unwrap();
            store.close().unwrap();
        }
        let store = open(&path);
        assert_eq!(store.size(), 2 * LEN_WIDTH + 11);
        let (_, pos) = store.append(b"third").unwrap();
        assert_eq!(store.read(pos).unwrap(), b"third");
    }

    #[test]
    fn test_store_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir.path().join("0.store"));
        store.append(b"keep").unwrap();
        let (_, pos) = store.append(b"drop").unwrap();
        store.truncate(pos).unwrap();
        assert_eq!(store.size(), pos);
        assert!(store.read(pos).is_err());

        let (_, again) = store.append(b"next").unwrap();
        assert_eq!(again, pos);
        assert_eq!(store.read(again).unwrap(), b"next");
    }

    #[test]
    fn test_store_flush_survives_lost_handle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.store");
        let store = open(&path);
        store.append(b"durable").unwrap();
        store.flush().unwrap();
        // 不执行析构，模拟进程被杀
        std::mem::forget(store);

        let store = open(&path);
        assert_eq!(store.size(), LEN_WIDTH + 7);
        assert_eq!(store.read(0).unwrap(), b"durable");
    }

    #[test]
    fn test_store_entry_end() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("0.store");
        let store = open(&path);
        let (n, pos) = store.append(b"whole").unwrap();
        assert_eq!(store.entry_end(pos).unwrap(), Some(n));
        assert_eq!(store.entry_end(n).unwrap(), None);
        store.close().unwrap();
        drop(store);

        // 截断到长度前缀之后，负载不完整
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(LEN_WIDTH + 2)
            .unwrap();
        let store = open(&path);
        assert_eq!(store.entry_end(0).unwrap(), None);
    }
}
