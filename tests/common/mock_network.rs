// mock_network.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use distlog::error::{RpcError, RpcResult};
use distlog::raft::{Message, Network, RaftNode};
use distlog::types::{NodeId, Peer};

#[derive(Default)]
struct HubInner {
    nodes: HashMap<String, Arc<RaftNode>>,
    isolated: HashSet<NodeId>,
}

/// In-process transport: hands messages straight to the target node.
#[derive(Clone, Default)]
pub struct MockNetworkHub {
    inner: Arc<RwLock<HubInner>>,
}

impl MockNetworkHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: &str, node: Arc<RaftNode>) {
        self.inner.write().nodes.insert(addr.to_string(), node);
    }

    pub fn unregister(&self, addr: &str) {
        self.inner.write().nodes.remove(addr);
    }

    /// Drops every message to and from `id`.
    pub fn isolate(&self, id: &str) {
        self.inner.write().isolated.insert(id.to_string());
    }

    pub fn restore(&self, id: &str) {
        self.inner.write().isolated.remove(id);
    }

    pub fn is_isolated(&self, id: &str) -> bool {
        self.inner.read().isolated.contains(id)
    }
}

#[async_trait]
impl Network for MockNetworkHub {
    async fn send(&self, from: &Peer, target: &Peer, message: Message) -> RpcResult<()> {
        let node = {
            let inner = self.inner.read();
            if inner.isolated.contains(&from.id) || inner.isolated.contains(&target.id) {
                return Err(RpcError::Network(format!("{} is unreachable", target)));
            }
            inner.nodes.get(&target.addr).cloned()
        };
        match node {
            Some(node) => node
                .deliver(from.clone(), message)
                .map_err(|e| RpcError::Network(e.to_string())),
            None => Err(RpcError::Network(format!("unknown target {}", target))),
        }
    }
}
