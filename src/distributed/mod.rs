//! The replicated commit log: consensus in front of a local [`Log`].
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! {data_dir}/
//! ├── log/            # application segments
//! └── raft/
//!     ├── log/        # consensus log segments
//!     ├── stable      # term and vote
//!     └── snapshots/  # latest snapshot
//! ```

mod fsm;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Span, info, warn};

pub use fsm::{Command, CommandResponse, Fsm, RequestType};

use crate::config::Config;
use crate::error::{ConsensusError, Result};
use crate::network::RaftTransportService;
use crate::network::pb::raft_server::RaftServer;
use crate::raft::{Network, RaftNode, RaftStorage};
use crate::replicator::LocalProducer;
use crate::server::CommitLog;
use crate::storage::log::Log;
use crate::storage::{FileSnapshotStorage, FileStableStore, RaftLogStore, SnapshotStorageOptions};
use crate::types::{Offset, Peer, Record, ServerInfo};

pub struct DistributedLog {
    data_dir: PathBuf,
    log: Arc<Log>,
    raft_log: Arc<RaftLogStore>,
    raft: Arc<RaftNode>,
    span: Span,
}

impl DistributedLog {
    /// Opens both logs under `data_dir` and starts consensus.
    pub async fn new(
        data_dir: impl AsRef<Path>,
        config: Config,
        network: Arc<dyn Network>,
        span: Span,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let log = Arc::new(Log::new(data_dir.join("log"), config.segment.clone(), span.clone())?);

        let raft_dir = data_dir.join("raft");
        let raft_log = Arc::new(RaftLogStore::new(
            raft_dir.join("log"),
            config.segment.clone(),
            span.clone(),
        )?);
        let stable = Arc::new(FileStableStore::new(raft_dir.join("stable"), span.clone())?);
        let snapshots = Arc::new(FileSnapshotStorage::new(
            SnapshotStorageOptions::with_base_dir(raft_dir.join("snapshots")),
            span.clone(),
        )?);

        let fsm = Arc::new(Fsm::new(log.clone(), config.segment.initial_offset, span.clone()));
        let peer = Peer::new(config.raft.local_id.clone(), config.raft.advertise_addr.clone());
        let storage = RaftStorage {
            log: raft_log.clone(),
            stable,
            snapshots,
        };
        let raft = RaftNode::start(peer, config.raft.clone(), storage, fsm, network, span.clone()).await?;

        info!(parent: &span, "Distributed log opened at {:?}", data_dir);
        Ok(Self {
            data_dir,
            log,
            raft_log,
            raft: Arc::new(raft),
            span,
        })
    }

    /// Appends `record` through consensus and returns its offset.
    pub async fn append(&self, record: Record) -> Result<Offset> {
        let command = Command::Append(record).encode()?;
        let response = self.raft.propose(command).await.map_err(|e| {
            warn!(parent: &self.span, "Append failed: {}", e);
            e
        })?;
        match CommandResponse::decode(&response).map_err(ConsensusError::from)? {
            CommandResponse::Append { offset } => Ok(offset),
        }
    }

    /// Reads from the local log. Followers may lag the leader.
    pub fn read(&self, offset: Offset) -> Result<Record> {
        Ok(self.log.read(offset)?)
    }

    pub fn lowest_offset(&self) -> Offset {
        self.log.lowest_offset()
    }

    pub fn highest_offset(&self) -> Option<Offset> {
        self.log.highest_offset()
    }

    /// Adds `id` as a voter. A no-op when it already votes from `addr`.
    pub async fn join(&self, id: &str, addr: &str) -> Result<()> {
        self.raft.add_voter(Peer::new(id, addr)).await?;
        info!(parent: &self.span, "{} joined at {}", id, addr);
        Ok(())
    }

    pub async fn leave(&self, id: &str) -> Result<()> {
        self.raft.remove_server(id).await?;
        info!(parent: &self.span, "{} left", id);
        Ok(())
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<Peer> {
        Ok(self.raft.wait_for_leader(timeout).await?)
    }

    pub async fn get_servers(&self) -> Result<Vec<ServerInfo>> {
        Ok(self.raft.servers().await?)
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader(&self) -> Option<Peer> {
        self.raft.leader()
    }

    /// The consensus node, for transports that deliver messages in process.
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// gRPC service feeding consensus messages from peers to this node.
    pub fn raft_service(&self) -> RaftServer<RaftTransportService> {
        RaftTransportService::new(self.raft.clone()).into_server()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Stops consensus, then closes both logs.
    pub async fn close(&self) -> Result<()> {
        self.raft.shutdown().await;
        self.raft_log.close()?;
        self.log.close()?;
        info!(parent: &self.span, "Distributed log closed");
        Ok(())
    }
}

#[async_trait]
impl LocalProducer for DistributedLog {
    async fn produce(&self, record: Record) -> Result<Offset> {
        self.append(record).await
    }
}

#[async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> Result<Offset> {
        DistributedLog::append(self, record).await
    }

    fn read(&self, offset: Offset) -> Result<Record> {
        DistributedLog::read(self, offset)
    }

    fn lowest_offset(&self) -> Offset {
        DistributedLog::lowest_offset(self)
    }

    async fn get_servers(&self) -> Result<Vec<ServerInfo>> {
        DistributedLog::get_servers(self).await
    }
}
