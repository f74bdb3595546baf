//! The segmented commit log.
//!
//! This module provides the ordered set of segments behind a single log:
//! - Rotation after the append that fills the active segment
//! - Cross-segment reads by binary search over base offsets
//! - Prefix truncation of whole segments, suffix truncation in place
//! - A raw byte reader over every segment for snapshots

use std::{
    collections::BTreeSet,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{Span, debug, info, warn};

use super::{entry::parse_segment_file_name, segment::Segment, store::Store};
use crate::config::SegmentConfig;
use crate::error::{StorageError, StorageResult};
use crate::types::Record;

struct LogInner {
    /// Sorted by base offset; the last one is active.
    segments: Vec<Segment>,
}

pub struct Log {
    dir: PathBuf,
    config: SegmentConfig,
    span: Span,
    inner: RwLock<LogInner>,
}

impl Log {
    /// Opens the log in `dir`, reloading any segments already there.
    pub fn new(dir: impl AsRef<Path>, config: SegmentConfig, span: Span) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = config.normalized();
        fs::create_dir_all(&dir).map_err(|e| {
            warn!(parent: &span, "Failed to create log directory {:?}: {}", dir, e);
            e
        })?;

        let segments = Self::load_or_create_segments(&dir, &config, &span)?;
        Ok(Self {
            dir,
            config,
            span,
            inner: RwLock::new(LogInner { segments }),
        })
    }

    fn load_or_create_segments(
        dir: &Path,
        config: &SegmentConfig,
        span: &Span,
    ) -> StorageResult<Vec<Segment>> {
        // Every base offset appears twice, once per file
        let mut base_offsets = BTreeSet::new();
        for entry in fs::read_dir(dir)?.flatten() {
            if let Some(base) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                base_offsets.insert(base);
            }
        }

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base in base_offsets {
            segments.push(Segment::new(dir, base, config.clone())?);
        }

        if segments.is_empty() {
            segments.push(Segment::new(dir, config.initial_offset, config.clone())?);
            debug!(parent: span, "Created log at {:?} starting at {}", dir, config.initial_offset);
        } else {
            info!(
                parent: span,
                "Loaded {} segments from {:?}, offsets [{}, {})",
                segments.len(),
                dir,
                segments[0].base_offset(),
                segments[segments.len() - 1].next_offset()
            );
        }
        Ok(segments)
    }

    fn new_segment(&self, base_offset: u64) -> StorageResult<Segment> {
        debug!(parent: &self.span, "Opening segment {} in {:?}", base_offset, self.dir);
        Segment::new(&self.dir, base_offset, self.config.clone())
    }

    /// Appends `record` and returns its offset.
    pub fn append(&self, record: Record) -> StorageResult<u64> {
        let mut inner = self.inner.write();

        // A segment reopened at capacity must not take the write.
        if Self::active(&inner).is_maxed() {
            let next = Self::active(&inner).next_offset();
            let segment = self.new_segment(next)?;
            inner.segments.push(segment);
        }

        let active = Self::active_mut(&mut inner);
        let offset = active.append(record)?;
        if active.is_maxed() {
            // 轮转后只会刷新新的活动分片
            active.flush()?;
            let segment = self.new_segment(offset + 1)?;
            inner.segments.push(segment);
        }
        Ok(offset)
    }

    /// Makes every append so far durable. Rotated-out segments are flushed
    /// when they fill, so only the active one can hold buffered bytes.
    pub fn flush(&self) -> StorageResult<()> {
        let inner = self.inner.read();
        Self::active(&inner).flush().map_err(|e| {
            warn!(parent: &self.span, "Failed to flush log {:?}: {}", self.dir, e);
            e
        })
    }

    pub fn read(&self, offset: u64) -> StorageResult<Record> {
        let inner = self.inner.read();
        let i = inner.segments.partition_point(|s| s.base_offset() <= offset);
        if i == 0 {
            return Err(StorageError::OffsetOutOfRange(offset));
        }
        let segment = &inner.segments[i - 1];
        if offset >= segment.next_offset() {
            return Err(StorageError::OffsetOutOfRange(offset));
        }
        segment.read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.inner.read().segments[0].base_offset()
    }

    /// Offset of the newest record, `None` while the log is empty.
    pub fn highest_offset(&self) -> Option<u64> {
        let inner = self.inner.read();
        let next = Self::active(&inner).next_offset();
        if next == inner.segments[0].base_offset() {
            None
        } else {
            Some(next - 1)
        }
    }

    /// Offset the next append will receive.
    pub fn next_offset(&self) -> u64 {
        Self::active(&self.inner.read()).next_offset()
    }

    /// Removes every segment whose records are all below `lowest`.
    pub fn truncate(&self, lowest: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let next = Self::active(&inner).next_offset();

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.segments)
            .into_iter()
            .partition(|s| s.next_offset() <= lowest);
        inner.segments = kept;

        if !removed.is_empty() {
            info!(parent: &self.span, "Truncating {} segments below offset {}", removed.len(), lowest);
        }
        let result = self.remove_segments(removed);
        if inner.segments.is_empty() {
            inner.segments.push(self.new_segment(lowest.max(next))?);
        }
        result
    }

    /// Removes every record at or after `from`.
    pub fn truncate_suffix(&self, from: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        if from >= Self::active(&inner).next_offset() {
            return Ok(());
        }

        let keep = inner.segments.partition_point(|s| s.base_offset() < from);
        let removed = inner.segments.split_off(keep);
        let result = self.remove_segments(removed);
        if inner.segments.is_empty() {
            inner.segments.push(self.new_segment(from)?);
        } else {
            Self::active_mut(&mut inner).truncate_from(from)?;
        }

        debug!(parent: &self.span, "Truncated log suffix from offset {}", from);
        result
    }

    /// Discards every record and restarts the log at `initial_offset`.
    pub fn reset(&self, initial_offset: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let removed = std::mem::take(&mut inner.segments);
        let result = self.remove_segments(removed);
        inner.segments.push(self.new_segment(initial_offset)?);
        info!(parent: &self.span, "Reset log {:?} to offset {}", self.dir, initial_offset);
        result
    }

    /// Removes every segment, reporting the last failure.
    fn remove_segments(&self, segments: Vec<Segment>) -> StorageResult<()> {
        let mut result = Ok(());
        for segment in segments {
            let base = segment.base_offset();
            if let Err(e) = segment.remove() {
                warn!(parent: &self.span, "Failed to remove segment {}: {}", base, e);
                result = Err(e);
            }
        }
        result
    }

    /// Raw store bytes of every segment present now, in offset order.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        let stores = inner
            .segments
            .iter()
            .map(|s| {
                let store = s.store();
                let limit = store.size();
                (store, limit)
            })
            .collect();
        LogReader {
            stores,
            current: 0,
            pos: 0,
        }
    }

    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Closes the log and deletes its directory.
    pub fn remove(&self) -> StorageResult<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn active(inner: &LogInner) -> &Segment {
        &inner.segments[inner.segments.len() - 1]
    }

    fn active_mut(inner: &mut LogInner) -> &mut Segment {
        let last = inner.segments.len() - 1;
        &mut inner.segments[last]
    }
}

/// Forward-only reader over the raw store bytes captured by [`Log::reader`].
pub struct LogReader {
    stores: Vec<(Arc<Store>, u64)>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some((store, limit)) = self.stores.get(self.current) {
            let n = store.read_at(buf, self.pos, *limit)?;
            if n > 0 {
                self.pos += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.pos = 0;
        }
        Ok(0)
    }
}
