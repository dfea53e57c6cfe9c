//! Nodes joining an existing cluster converge on the same system tables.

use crate::cache::schema::NODES;
use crate::e2e_tests::helpers::{TestCluster, partition_of, pending_messages, wait_until};

#[tokio::test]
async fn test_second_node_joins() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let second = cluster.join("node2", first).await;
    cluster.wait_for_node_count(2).await;

    let (node1, node2) = (cluster.node(first), cluster.node(second));
    assert_eq!(node2.latency_zone(), "default");
    assert!(node2.partitions().all().is_empty(), "joining node owns no partitions");

    for node in [node1, node2] {
        let record = node
            .context()
            .nodes()
            .get_node_by_id(node2.id())
            .await
            .expect("lookup")
            .expect("node2 known");
        assert_eq!(record.external_address, "mem://node2");
    }

    // node2's message group includes node1.
    wait_until("node2's message group to reach node1", || async move {
        node1
            .context()
            .raft_groups()
            .get_raft_group_by_id(node2.message_group_id())
            .await
            .expect("lookup")
            .is_some_and(|group| group.member_ids() == [node2.id().to_owned(), node1.id().to_owned()])
    })
    .await;
    assert!(
        node2
            .messaging()
            .message_group()
            .group()
            .members()
            .expect("members")
            .contains(&"mem://node1".to_owned())
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    cluster.join("node2", first).await;
    cluster.wait_for_node_count(2).await;
    let third = cluster.join("node3", first).await;
    cluster.wait_for_node_count(3).await;

    // CACHE_SYNC reached node2 even though node3 only talked to node1.
    let node2 = cluster.node(1);
    let node3 = node2
        .context()
        .nodes()
        .get_node_by_id(cluster.node(third).id())
        .await
        .expect("lookup")
        .expect("node3 known to node2");
    assert_eq!(node3.latency_zone, "default");

    for node in &cluster.nodes {
        wait_until("message log to drain", || async move { pending_messages(node).await == 0 }).await;
    }

    let snapshots = futures::future::join_all(cluster.nodes.iter().map(|node| async {
        node.context()
            .nodes()
            .cache()
            .serialize()
            .await
            .expect("serialize")
    }))
    .await;
    assert!(snapshots.windows(2).all(|pair| pair[0] == pair[1]));

    // The owner's partition stores every node row too.
    let node1 = cluster.node(first);
    let partition_id = partition_of(node1, NODES.table_name).await;
    let rows = node1
        .partitions()
        .get(&partition_id)
        .expect("hosted")
        .query("SELECT id FROM nodes", vec![])
        .await
        .expect("query");
    assert_eq!(rows.len(), 3);

    cluster.shutdown().await;
}
