//! Helpers shared by the server integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use quorumkv_core::KvStore;
use quorumkv_server::{ClusterNode, NodeConfig, RaftTimings};

/// Next free consensus address from `counter`. Ports step by two because
/// the forwarding port is always the consensus port + 1.
pub fn next_raft_addr(counter: &AtomicU16) -> String {
    let port = counter.fetch_add(2, Ordering::SeqCst);
    format!("127.0.0.1:{}", port)
}

pub fn test_timings() -> RaftTimings {
    RaftTimings {
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        heartbeat_interval_ms: 30,
        tick_interval_ms: 5,
        rpc_timeout_ms: 300,
        max_append_entries: 64,
    }
}

pub fn test_config(raft_addr: &str, data_dir: &Path, single: bool) -> NodeConfig {
    NodeConfig::builder()
        .raft_addr(raft_addr)
        .data_dir(data_dir)
        .enable_single(single)
        .raft_timings(test_timings())
        .apply_timeout(Duration::from_secs(5))
        .forward_timeout(Duration::from_secs(8))
        .build()
}

/// Create and start a node.
pub async fn start_node(config: NodeConfig) -> ClusterNode {
    let node = ClusterNode::new(config, KvStore::new())
        .await
        .expect("failed to create node");
    node.start().await.expect("failed to start node");
    node
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_leader(node: &ClusterNode) -> bool {
    wait_until(Duration::from_secs(5), move || async move { node.is_leader().await }).await
}

/// Wait until `node` reads `expected` for `key`.
pub async fn wait_for_value(node: &ClusterNode, key: &str, expected: Option<&str>) -> bool {
    wait_until(Duration::from_secs(5), move || async move {
        node.get(key).ok().flatten().as_deref() == expected
    })
    .await
}
