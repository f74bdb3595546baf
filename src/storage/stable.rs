use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{Span, debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::raft::{HardState, HardStateStorage};

const CRC_WIDTH: usize = 4;

/// Hard state in a single file: `[crc32 u32 BE][bincode HardState]`,
/// replaced atomically on every save.
pub struct FileStableStore {
    path: PathBuf,
    span: Span,
}

impl FileStableStore {
    pub fn new(path: impl AsRef<Path>, span: Span) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path, span })
    }

    pub fn save(&self, hard_state: &HardState) -> StorageResult<()> {
        let body = bincode::encode_to_vec(hard_state, bincode::config::standard())?;
        let mut data = Vec::with_capacity(CRC_WIDTH + body.len());
        data.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        data.extend_from_slice(&body);

        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| {
                warn!(parent: &self.span, "Failed to create {:?}: {}", tmp_path, e);
                e
            })?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            parent: &self.span,
            "Saved hard state term={} voted_for={:?}",
            hard_state.term,
            hard_state.voted_for
        );
        Ok(())
    }

    pub fn load(&self) -> StorageResult<Option<HardState>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() < CRC_WIDTH {
            return Err(StorageError::Corrupted(format!(
                "stable store {:?} is {} bytes",
                self.path,
                data.len()
            )));
        }

        let (crc, body) = data.split_at(CRC_WIDTH);
        let mut expected = [0u8; CRC_WIDTH];
        expected.copy_from_slice(crc);
        if crc32fast::hash(body) != u32::from_be_bytes(expected) {
            warn!(parent: &self.span, "Checksum mismatch in {:?}", self.path);
            return Err(StorageError::Corrupted(format!(
                "checksum mismatch in {:?}",
                self.path
            )));
        }
        let (hard_state, _) = bincode::decode_from_slice(body, bincode::config::standard())?;
        Ok(Some(hard_state))
    }
}

#[async_trait]
impl HardStateStorage for FileStableStore {
    async fn save_hard_state(&self, hard_state: &HardState) -> StorageResult<()> {
        self.save(hard_state)
    }

    async fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        self.load()
    }
}
