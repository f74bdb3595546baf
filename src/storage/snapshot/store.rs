//! File-based snapshot storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{Span, debug, error, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::raft::{ClusterConfig, Snapshot, SnapshotStorage};

/// Snapshot storage configuration options.
#[derive(Debug, Clone)]
pub struct SnapshotStorageOptions {
    /// Directory holding the snapshot files.
    pub base_dir: PathBuf,
    /// Whether to verify checksums when loading snapshots.
    pub verify_checksum: bool,
    /// Whether to sync data to disk after writes.
    pub sync_on_write: bool,
}

impl Default for SnapshotStorageOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/raft/snapshots"),
            verify_checksum: true,
            sync_on_write: true,
        }
    }
}

impl SnapshotStorageOptions {
    /// Create options with a custom base directory.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

/// Snapshot metadata stored separately for quick access.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    /// Last included index.
    pub index: u64,
    /// Last included term.
    pub term: u64,
    /// Cluster configuration at snapshot time.
    pub config: ClusterConfig,
    /// SHA256 checksum of the data file.
    pub checksum: String,
    pub data_size: u64,
    /// Seconds since the epoch.
    pub created_at: u64,
}

/// File-based snapshot storage.
///
/// No in-memory caching is used since a snapshot holds the whole commit log.
/// Each load reads directly from disk.
#[derive(Clone)]
pub struct FileSnapshotStorage {
    options: SnapshotStorageOptions,
    span: Span,
}

impl FileSnapshotStorage {
    pub fn new(options: SnapshotStorageOptions, span: Span) -> StorageResult<Self> {
        fs::create_dir_all(&options.base_dir).map_err(|e| {
            warn!(
                parent: &span,
                "Failed to create snapshot directory {:?}: {}",
                options.base_dir,
                e
            );
            e
        })?;
        info!(parent: &span, "Snapshot storage at {:?}", options.base_dir);
        Ok(Self { options, span })
    }

    fn meta_path(&self) -> PathBuf {
        self.options.base_dir.join("meta.json")
    }

    fn data_path(&self) -> PathBuf {
        self.options.base_dir.join("data.bin")
    }

    fn checksum_path(&self) -> PathBuf {
        self.options.base_dir.join("checksum.sha256")
    }

    /// Calculate SHA256 checksum of data.
    pub(crate) fn calculate_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    pub(crate) fn verify_checksum(data: &[u8], expected: &str) -> bool {
        Self::calculate_checksum(data) == expected
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(data)?;
        if self.options.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Writes data, checksum and metadata to temporary files, then renames
    /// them into place; the metadata rename publishes the snapshot.
    fn write_snapshot_atomic(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let checksum = Self::calculate_checksum(&snapshot.data);
        let meta = SnapshotMeta {
            index: snapshot.index,
            term: snapshot.term,
            config: snapshot.config.clone(),
            checksum: checksum.clone(),
            data_size: snapshot.data.len() as u64,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StorageError::Codec(format!("snapshot metadata: {}", e)))?;

        let data_path = self.data_path();
        let data_tmp_path = data_path.with_extension("bin.tmp");
        self.write_file(&data_tmp_path, &snapshot.data).map_err(|e| {
            warn!(parent: &self.span, "Failed to write {:?}: {}", data_tmp_path, e);
            e
        })?;

        let checksum_path = self.checksum_path();
        let checksum_tmp_path = checksum_path.with_extension("sha256.tmp");
        self.write_file(&checksum_tmp_path, checksum.as_bytes())?;

        let meta_path = self.meta_path();
        let meta_tmp_path = meta_path.with_extension("json.tmp");
        self.write_file(&meta_tmp_path, meta_json.as_bytes())?;

        fs::rename(&data_tmp_path, &data_path)?;
        fs::rename(&checksum_tmp_path, &checksum_path)?;
        fs::rename(&meta_tmp_path, &meta_path).map_err(|e| {
            warn!(parent: &self.span, "Failed to publish snapshot metadata: {}", e);
            let _ = fs::remove_file(&data_path);
            e
        })?;

        debug!(
            parent: &self.span,
            "Snapshot saved: index={}, term={}, size={}",
            snapshot.index,
            snapshot.term,
            snapshot.data.len()
        );
        Ok(())
    }

    fn read_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        let meta_content = match fs::read_to_string(self.meta_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = serde_json::from_str(&meta_content)
            .map_err(|e| StorageError::Corrupted(format!("snapshot metadata: {}", e)))?;
        Ok(Some(meta))
    }

    fn read_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        let Some(meta) = self.read_meta()? else {
            return Ok(None);
        };

        let data_path = self.data_path();
        let mut data_file = File::open(&data_path).map_err(|e| {
            warn!(parent: &self.span, "Failed to open {:?}: {}", data_path, e);
            e
        })?;
        let mut data = Vec::with_capacity(meta.data_size as usize);
        data_file.read_to_end(&mut data)?;

        if self.options.verify_checksum && !Self::verify_checksum(&data, &meta.checksum) {
            error!(parent: &self.span, "Snapshot checksum verification failed at index {}", meta.index);
            return Err(StorageError::Corrupted(format!(
                "snapshot {} failed checksum verification",
                meta.index
            )));
        }

        debug!(parent: &self.span, "Snapshot loaded: index={}, term={}", meta.index, meta.term);
        Ok(Some(Snapshot {
            index: meta.index,
            term: meta.term,
            config: meta.config,
            data,
        }))
    }

    /// Index and term of the stored snapshot without loading its data.
    pub fn latest_meta(&self) -> StorageResult<Option<(u64, u64)>> {
        Ok(self.read_meta()?.map(|meta| (meta.index, meta.term)))
    }
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn save_snapshot(&self, snap: Snapshot) -> StorageResult<()> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.write_snapshot_atomic(&snap))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(format!("snapshot save task failed: {}", e))))?
    }

    async fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.read_snapshot())
            .await
            .map_err(|e| StorageError::Io(io::Error::other(format!("snapshot load task failed: {}", e))))?
    }
}
