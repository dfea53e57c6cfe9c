//! Live queries registered on a remote partition.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::cache::schema::NODES;
use crate::e2e_tests::helpers::{TestCluster, partition_of, pending_messages, wait_until};
use crate::node::Node;
use crate::partition_layer::{
    LiveQueryUpdate, deregister_remote_live_query, query_remote_partition, register_remote_live_query,
};

/// Collect every live query update that reaches `node`.
fn collect_updates(node: &Node) -> Arc<Mutex<Vec<LiveQueryUpdate>>> {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    node.on_live_query_update(move |update| {
        sink.lock().expect("lock").push(update);
        async { Ok(()) }
    })
    .expect("listen");
    updates
}

#[tokio::test]
async fn test_join_notifies_zone_subscribers() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    let second = cluster.join("node2", first).await;
    cluster.wait_for_node_count(2).await;

    let updates = collect_updates(cluster.node(second));
    let partition_id = partition_of(cluster.node(first), NODES.table_name).await;
    {
        let (node1, node2) = (cluster.node(first), cluster.node(second));
        register_remote_live_query(
            node2.messaging(),
            node1.address(),
            &partition_id,
            "zones",
            &["latencyZone".to_owned()],
            &[node2.address().to_owned()],
        )
        .await
        .expect("register");
        let registered = node1
            .partitions()
            .get(&partition_id)
            .expect("hosted")
            .live_queries()
            .await
            .expect("list");
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].columns, ["latencyzone"]);
    }

    cluster.join("node3", first).await;
    cluster.wait_for_node_count(3).await;
    let (node1, node2) = (cluster.node(first), cluster.node(second));

    wait_until("live query update", || {
        let updates = Arc::clone(&updates);
        async move { !updates.lock().expect("lock").is_empty() }
    })
    .await;
    {
        let updates = updates.lock().expect("lock");
        assert_eq!(updates[0].subscription_id, "zones");
        assert_eq!(updates[0].partition_id, partition_id);
        assert!(updates[0].sql.contains("nodes"));
    }
    // Delivered updates are acknowledged, so nothing stays in the host's log.
    wait_until("node1's log to drain", || async move { pending_messages(node1).await == 0 }).await;

    let mut ids: Vec<String> = query_remote_partition(node2.messaging(), node1.address(), &partition_id, "SELECT id FROM nodes", vec![])
        .await
        .expect("query")
        .into_iter()
        .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_owned))
        .collect();
    ids.sort();
    let mut expected: Vec<String> = cluster.nodes.iter().map(|node| node.id().to_owned()).collect();
    expected.sort();
    assert_eq!(ids, expected);

    assert!(
        deregister_remote_live_query(node2.messaging(), node1.address(), &partition_id, "zones")
            .await
            .expect("deregister")
    );
    assert!(
        !deregister_remote_live_query(node2.messaging(), node1.address(), &partition_id, "zones")
            .await
            .expect("deregister")
    );

    cluster.shutdown().await;
}
