use std::io::Read;

use async_trait::async_trait;

use super::message::{HardState, LogEntry, Message, Snapshot};
use crate::error::{ApplyResult, RpcResult, StorageResult};
use crate::types::Peer;

#[async_trait]
pub trait Network: Send + Sync {
    // 尽力而为的单向投递，丢失由心跳重试弥补
    async fn send(&self, from: &Peer, target: &Peer, message: Message) -> RpcResult<()>;
}

#[async_trait]
pub trait HardStateStorage: Send + Sync {
    async fn save_hard_state(&self, hard_state: &HardState) -> StorageResult<()>;
    async fn load_hard_state(&self) -> StorageResult<Option<HardState>>;
}

/// Consensus log. An empty log reports `first_index == last_index + 1`.
#[async_trait]
pub trait LogEntryStorage: Send + Sync {
    async fn first_index(&self) -> StorageResult<u64>;
    async fn last_index(&self) -> StorageResult<u64>;
    async fn get_log(&self, index: u64) -> StorageResult<LogEntry>;
    /// Entries must continue the log without gaps.
    async fn store_logs(&self, entries: &[LogEntry]) -> StorageResult<()>;
    /// Deletes `[min, max]`. Only prefix and suffix ranges are supported.
    async fn delete_range(&self, min: u64, max: u64) -> StorageResult<()>;
    /// Drops everything; the next stored entry must be `next_index`.
    async fn reset(&self, next_index: u64) -> StorageResult<()>;
}

#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    async fn save_snapshot(&self, snap: Snapshot) -> StorageResult<()>;
    async fn load_snapshot(&self) -> StorageResult<Option<Snapshot>>;
}

#[async_trait]
pub trait StateMachine: Send + Sync {
    // 日志应用到状态机的回调，返回值原样交给提案方
    async fn apply(&self, index: u64, command: &[u8]) -> ApplyResult<Vec<u8>>;

    /// Point-in-time view of the whole state.
    fn snapshot(&self) -> StorageResult<Box<dyn Read + Send>>;

    /// Replaces the whole state with the contents of `data`.
    fn restore(&self, data: &mut (dyn Read + Send)) -> StorageResult<()>;
}
