use std::time::Duration;

use tempfile::TempDir;

use distlog::config::Config;
use distlog::types::Record;

mod common;
use common::mock_network::MockNetworkHub;
use common::test_cluster::{TestNode, addr_of, fast_config};
use common::{eventually, init_tracing};

const WAIT: Duration = Duration::from_secs(5);

fn compacting(id: &str, bootstrap: bool) -> Config {
    let mut config = fast_config(id, bootstrap);
    config.raft.snapshot_threshold = 4;
    config.raft.trailing_logs = 0;
    config
}

fn snapshot_taken(node: &TestNode) -> bool {
    node.dir.path().join("raft").join("snapshots").join("meta.json").exists()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_installs_snapshot() {
    init_tracing();
    let hub = MockNetworkHub::new();
    let node1 = TestNode::open(&hub, TempDir::new().unwrap(), compacting("node1", true)).await;
    node1.log.wait_for_leader(WAIT).await.unwrap();

    for i in 0..20u64 {
        let offset = node1
            .log
            .append(Record::new(format!("record-{}", i).into_bytes()))
            .await
            .unwrap();
        assert_eq!(offset, i);
    }
    eventually(WAIT, || async { snapshot_taken(&node1).then_some(()) })
        .await
        .expect("no snapshot taken");

    // node2 的日志为空，只能通过快照追上
    let node2 = TestNode::open(&hub, TempDir::new().unwrap(), compacting("node2", false)).await;
    node1.log.join("node2", &addr_of("node2")).await.unwrap();

    for i in 0..20u64 {
        let record = node2.wait_for_record(i, WAIT).await.unwrap();
        assert_eq!(record.value, format!("record-{}", i).into_bytes());
    }

    let offset = node1.log.append(Record::new(b"after snapshot".to_vec())).await.unwrap();
    assert_eq!(offset, 20);
    let record = node2.wait_for_record(20, WAIT).await.unwrap();
    assert_eq!(record.value, b"after snapshot");

    node2.log.close().await.unwrap();
    node1.log.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_from_snapshot() {
    init_tracing();
    let hub = MockNetworkHub::new();
    let node = TestNode::open(&hub, TempDir::new().unwrap(), compacting("node1", true)).await;
    node.log.wait_for_leader(WAIT).await.unwrap();
    for i in 0..10u64 {
        node.log.append(Record::new(format!("r{}", i).into_bytes())).await.unwrap();
    }
    eventually(WAIT, || async { snapshot_taken(&node).then_some(()) })
        .await
        .unwrap();
    node.log.close().await.unwrap();

    let TestNode { dir, .. } = node;
    let node = TestNode::open(&hub, dir, compacting("node1", true)).await;
    node.log.wait_for_leader(WAIT).await.unwrap();
    for i in 0..10u64 {
        let record = node.wait_for_record(i, WAIT).await.unwrap();
        assert_eq!(record.value, format!("r{}", i).into_bytes());
    }
    assert_eq!(node.log.append(Record::new(b"r10".to_vec())).await.unwrap(), 10);
    node.log.close().await.unwrap();
}
