//! A replicated, append-only commit log.
//!
//! Records are appended to a segmented on-disk [`Log`](storage::log::Log)
//! through consensus ([`raft`]), served over gRPC ([`server`]) and optionally
//! mirrored between nodes ([`replicator`]). [`agent::Agent`] wires a full node.

pub mod agent;
pub mod config;
pub mod distributed;
pub mod error;
pub mod network;
pub mod raft;
pub mod replicator;
pub mod server;
pub mod storage;
pub mod types;

pub use agent::{Agent, AgentConfig, MembershipHandler, ReplicationMode};
pub use config::{Config, RaftConfig, SegmentConfig};
pub use distributed::DistributedLog;
pub use error::{Error, Result};
pub use types::{NodeId, Offset, Peer, Record, ServerInfo};
