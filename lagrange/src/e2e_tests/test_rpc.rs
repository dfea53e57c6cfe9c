//! Request/response between running nodes.

use std::time::Duration;

use serde_json::json;

use crate::cache::schema::NODES;
use crate::e2e_tests::helpers::{TestCluster, partition_of};
use crate::messaging::layer::MessagingError;
use crate::partition_layer::query_remote_partition;

#[tokio::test]
async fn test_ping_between_nodes() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let second = cluster.join("node2", first).await;

    let rtt = cluster
        .node(second)
        .messaging()
        .ping_node(cluster.node(first).address())
        .await
        .expect("ping");
    assert!(rtt < Duration::from_secs(1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remote_errors_are_returned() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let second = cluster.join("node2", first).await;
    let (node1, node2) = (cluster.node(first), cluster.node(second));

    let result = query_remote_partition(node2.messaging(), node1.address(), "no-such-partition", "SELECT 1", vec![]).await;
    assert!(matches!(result, Err(MessagingError::Remote(_))), "{result:?}");

    let partition_id = partition_of(node1, NODES.table_name).await;
    let result = query_remote_partition(node2.messaging(), node1.address(), &partition_id, "SELEKT", vec![]).await;
    assert!(matches!(result, Err(MessagingError::Remote(_))), "{result:?}");

    let rows = query_remote_partition(
        node2.messaging(),
        node1.address(),
        &partition_id,
        "SELECT id FROM nodes WHERE id = ?",
        vec![json!(node1.id())],
    )
    .await
    .expect("query");
    assert_eq!(rows.len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rpc_to_unreachable_node_times_out() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let second = cluster.join("node2", first).await;
    cluster.network.set_blocked("mem://node1", true).expect("block");

    let result = cluster
        .node(second)
        .messaging()
        .ping_node("mem://node1")
        .await;
    assert!(
        matches!(&result, Err(MessagingError::RpcTimeout(address)) if address == "mem://node1"),
        "{result:?}"
    );

    cluster.shutdown().await;
}
