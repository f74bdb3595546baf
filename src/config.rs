//! Tuning options shared by the storage engine and the consensus layer.

use std::time::Duration;

use crate::types::NodeId;

const DEFAULT_MAX_STORE_BYTES: u64 = 1024;
const DEFAULT_MAX_INDEX_BYTES: u64 = 1024;

/// Options for a single log's segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// A segment is sealed once its store reaches this many bytes.
    pub max_store_bytes: u64,
    /// A segment is sealed once its index reaches this many bytes.
    pub max_index_bytes: u64,
    /// Offset assigned to the first record of a fresh log.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: DEFAULT_MAX_STORE_BYTES,
            max_index_bytes: DEFAULT_MAX_INDEX_BYTES,
            initial_offset: 0,
        }
    }
}

impl SegmentConfig {
    /// Replaces zero caps with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.max_store_bytes == 0 {
            self.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.max_index_bytes == 0 {
            self.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: u64) -> Self {
        self.initial_offset = initial_offset;
        self
    }
}

/// Consensus options.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub local_id: NodeId,
    /// Address other nodes reach this node's RPC server at.
    pub advertise_addr: String,
    /// Create a single-voter cluster when no prior state exists on disk.
    pub bootstrap: bool,
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout; the upper bound is twice this.
    pub election_timeout: Duration,
    /// How long `append` waits for its entry to commit.
    pub commit_timeout: Duration,
    pub max_append_entries: usize,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept in the log behind a snapshot for slow followers.
    pub trailing_logs: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            local_id: NodeId::new(),
            advertise_addr: String::new(),
            bootstrap: false,
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_secs(1),
            commit_timeout: Duration::from_secs(10),
            max_append_entries: 64,
            snapshot_threshold: 8192,
            trailing_logs: 10240,
        }
    }
}

impl RaftConfig {
    pub fn with_local_id(local_id: impl Into<NodeId>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Default::default()
        }
    }
}

/// Options for a [`DistributedLog`](crate::distributed::DistributedLog).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub segment: SegmentConfig,
    pub raft: RaftConfig,
}
