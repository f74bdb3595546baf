// test_cluster.rs
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{Span, info};

use distlog::config::{Config, RaftConfig, SegmentConfig};
use distlog::distributed::DistributedLog;
use distlog::types::{Offset, Record};

use super::eventually;
use super::mock_network::MockNetworkHub;

pub fn fast_config(id: &str, bootstrap: bool) -> Config {
    Config {
        segment: SegmentConfig::default(),
        raft: RaftConfig {
            local_id: id.to_string(),
            advertise_addr: addr_of(id),
            bootstrap,
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(300),
            commit_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    }
}

pub fn addr_of(id: &str) -> String {
    format!("mem://{}", id)
}

pub struct TestNode {
    pub id: String,
    pub log: Arc<DistributedLog>,
    pub dir: TempDir,
}

impl TestNode {
    pub async fn open(hub: &MockNetworkHub, dir: TempDir, config: Config) -> Self {
        let id = config.raft.local_id.clone();
        let log = DistributedLog::new(dir.path(), config, Arc::new(hub.clone()), Span::none())
            .await
            .unwrap();
        let log = Arc::new(log);
        hub.register(&addr_of(&id), log.raft().clone());
        Self { id, log, dir }
    }

    /// Waits until the record at `offset` is readable here.
    pub async fn wait_for_record(&self, offset: Offset, timeout: Duration) -> Option<Record> {
        eventually(timeout, || async { self.log.read(offset).ok() }).await
    }
}

pub struct TestCluster {
    pub hub: MockNetworkHub,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Bootstraps the first node and adds the rest as voters.
    pub async fn new(size: usize, tune: impl Fn(&mut Config)) -> Self {
        let hub = MockNetworkHub::new();
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let id = format!("node{}", i + 1);
            let mut config = fast_config(&id, i == 0);
            tune(&mut config);
            nodes.push(TestNode::open(&hub, TempDir::new().unwrap(), config).await);
        }

        let cluster = Self { hub, nodes };
        let leader = &cluster.nodes[0];
        leader.log.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        for node in &cluster.nodes[1..] {
            leader.log.join(&node.id, &addr_of(&node.id)).await.unwrap();
        }
        info!("TestCluster created with {} nodes", size);
        cluster
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    /// A reachable node that currently believes it leads.
    pub async fn leader(&self, timeout: Duration) -> &TestNode {
        let index = eventually(timeout, || async {
            self.nodes
                .iter()
                .position(|n| n.log.is_leader() && !self.hub.is_isolated(&n.id))
        })
        .await
        .expect("no leader elected");
        &self.nodes[index]
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.log.close().await.unwrap();
        }
    }
}
