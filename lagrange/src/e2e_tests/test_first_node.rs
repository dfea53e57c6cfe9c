//! Bootstrapping a cluster with a single node.

use crate::cache::raft_groups::MESSAGES_GROUP_TYPE;
use crate::cache::schema::SYSTEM_TABLES;
use crate::e2e_tests::helpers::{TestCluster, node_count, pending_messages, wait_until};

#[tokio::test]
async fn test_first_node_creates_system_tables() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let node = cluster.node(first);
    let context = node.context();

    assert_eq!(node.address(), "mem://node1");
    assert_eq!(node.latency_zone(), "default");

    for (_, schema) in SYSTEM_TABLES {
        let table = context
            .tables()
            .get_table_by_name(schema.table_name)
            .await
            .expect("lookup")
            .expect("system table registered");
        assert_eq!(table.created_by.as_deref(), Some(node.id()));
    }

    let owned = context.partitions().owned_by(node.id()).await.expect("owned");
    assert_eq!(owned.len(), SYSTEM_TABLES.len());
    for partition in &owned {
        assert!(
            node.partitions().get(&partition.id).is_some(),
            "partition {} hosted",
            partition.id
        );
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_first_node_registers_itself() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let node = cluster.node(first);
    let context = node.context();

    assert_eq!(node_count(node).await, 1);
    let record = context
        .nodes()
        .get_node_by_address("mem://node1")
        .await
        .expect("lookup")
        .expect("node registered");
    assert_eq!(record.id, node.id());
    assert_eq!(record.latency_zone, "default");

    let group = context
        .raft_groups()
        .get_raft_group_by_id(node.message_group_id())
        .await
        .expect("lookup")
        .expect("message group registered");
    assert_eq!(group.group_type, MESSAGES_GROUP_TYPE);
    assert_eq!(group.member_ids(), [node.id().to_owned()]);

    // Updates routed to itself are acknowledged.
    wait_until("message log to drain", || async move { pending_messages(node).await == 0 }).await;

    cluster.shutdown().await;
}
