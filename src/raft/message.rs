use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::cluster_config::ClusterConfig;
use crate::error::{StorageError, StorageResult};
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Decode, Encode)]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
    /// Opaque state machine command.
    Command(Vec<u8>),
    /// Membership; takes effect as soon as it is appended.
    Config(ClusterConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Decode, Encode)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> StorageResult<(Self, usize)> {
        let config = bincode::config::standard();
        Ok(bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize log entry: {}", e);
            e
        })?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Decode, Encode)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Decode, Encode)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub config: ClusterConfig,
    pub data: Vec<u8>,
}

// === 网络接口 ===
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader, on success.
    pub matched_index: u64,
    /// Where the leader should resume, on failure.
    pub conflict_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfig,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
    pub last_index: u64,
}

/// Everything one node sends another. The sender travels in the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub enum Message {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl Message {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        let config = bincode::config::standard();
        let (message, read) = bincode::decode_from_slice(data, config)?;
        if read != data.len() {
            return Err(StorageError::Codec(format!(
                "{} trailing bytes after message",
                data.len() - read
            )));
        }
        Ok(message)
    }

    pub fn term(&self) -> u64 {
        match self {
            Message::RequestVote(m) => m.term,
            Message::RequestVoteResponse(m) => m.term,
            Message::AppendEntries(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshot(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_rejects_trailing_bytes() {
        let message = Message::RequestVoteResponse(RequestVoteResponse {
            term: 3,
            vote_granted: true,
        });
        let mut bytes = message.encode().unwrap();
        assert_eq!(Message::decode(&bytes).unwrap(), message);

        bytes.push(0);
        assert!(Message::decode(&bytes).is_err());
    }
}
