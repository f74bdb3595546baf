use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

// 类型定义
pub type NodeId = String;
pub type Offset = u64;

/// A single entry of the commit log. The offset is assigned by the log on append.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Record {
    pub value: Vec<u8>,
    pub offset: Offset,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            offset: 0,
        }
    }
}

/// A consensus participant and the address its RPC server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Peer {
    pub id: NodeId,
    pub addr: String,
}

impl Peer {
    pub fn new(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Cluster member as reported by `get_servers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: NodeId,
    pub rpc_addr: String,
    pub is_leader: bool,
}
