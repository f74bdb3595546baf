use thiserror::Error;
use tracing::{Span, error, info, warn};

use crate::types::NodeId;

/// Top-level error for the commit log.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
}

/// Segment, index and consensus-store failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    #[error("index full")]
    IndexFull,

    #[error("end of index")]
    IndexEof,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Snapshot not found")]
    SnapshotNotFound,
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}

/// Failures of a proposal or membership change.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Not leader (current leader: {0:?})")]
    NotLeader(Option<NodeId>),

    #[error("Request timeout")]
    Timeout,

    #[error("Consensus shut down")]
    Shutdown,

    #[error("Leadership lost before the entry committed")]
    LeadershipLost,

    #[error("Configuration change in progress")]
    ConfigChangeInProgress,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
}

/// Errors returned by the state machine for a committed command.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Unknown command type {0}")]
    UnknownCommand(u8),

    #[error("Empty command")]
    Empty,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Raft transport failures.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

/// Peer dial or stream failures inside a replication loop.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Failed to dial {addr}: {message}")]
    Dial { addr: String, message: String },

    #[error("Stream from {addr} failed: {status}")]
    Stream {
        addr: String,
        status: Box<tonic::Status>,
    },
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{subject} not permitted to {action} to {object}")]
    Denied {
        subject: String,
        object: String,
        action: String,
    },

    #[error("Couldn't find subject info")]
    Unauthenticated,

    #[error("Policy error: {0}")]
    Policy(String),
}

pub type Result<T> = std::result::Result<T, Error>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;
pub type ApplyResult<T> = std::result::Result<T, ApplyError>;
pub type RpcResult<T> = std::result::Result<T, RpcError>;

// === 统一错误处理机制 ===
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Fatal,       // 磁盘级故障，向上传播
    Recoverable, // 调用方可以重试或重定向到 leader
    Ignorable,   // 调用方请求本身有误，仅需记录
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::OffsetOutOfRange(_) => ErrorSeverity::Ignorable,
            StorageError::IndexFull => ErrorSeverity::Recoverable,
            StorageError::IndexEof => ErrorSeverity::Ignorable,
            StorageError::Codec(_) => ErrorSeverity::Fatal,
            StorageError::Corrupted(_) => ErrorSeverity::Fatal,
            StorageError::Consistency(_) => ErrorSeverity::Fatal,
            StorageError::SnapshotNotFound => ErrorSeverity::Recoverable,
        }
    }
}

impl ErrorHandler for ConsensusError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ConsensusError::Storage(e) => e.severity(),
            ConsensusError::Apply(ApplyError::Storage(e)) => e.severity(),
            ConsensusError::Apply(_) => ErrorSeverity::Ignorable,
            _ => ErrorSeverity::Recoverable,
        }
    }
}

impl ErrorHandler for RpcError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            RpcError::Network(_) => ErrorSeverity::Recoverable,
            RpcError::Codec(_) => ErrorSeverity::Fatal,
        }
    }
}

impl ErrorHandler for Error {
    fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Storage(e) => e.severity(),
            Error::Consensus(e) => e.severity(),
            Error::Replication(_) => ErrorSeverity::Recoverable,
            Error::Auth(_) => ErrorSeverity::Ignorable,
            Error::Rpc(e) => e.severity(),
        }
    }
}

/// Logs `result`'s error at a level chosen by its severity and drops it.
pub fn report<T, E>(span: &Span, result: std::result::Result<T, E>, operation: &str) -> Option<T>
where
    E: ErrorHandler + std::fmt::Display,
{
    match result {
        Ok(val) => Some(val),
        Err(e) => {
            match e.severity() {
                ErrorSeverity::Fatal => error!(parent: span, "[FATAL] {} failed: {}", operation, e),
                ErrorSeverity::Recoverable => {
                    warn!(parent: span, "[RECOVERABLE] {} failed: {}", operation, e)
                }
                ErrorSeverity::Ignorable => info!(parent: span, "[IGNORABLE] {} failed: {}", operation, e),
            }
            None
        }
    }
}
