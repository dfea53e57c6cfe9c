//! Unacknowledged messages are resent by housekeeping, and dropped once
//! their retries run out.

use crate::e2e_tests::helpers::{TestCluster, node_count, pending_messages, wait_until};

/// Start node1 and node2, cut node2 off, then let node3 join through node1.
/// Returns with node1 holding `CACHE_SYNC`s that node2 never received.
async fn partitioned_cluster() -> TestCluster {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    cluster.join("node2", first).await;
    cluster.wait_for_node_count(2).await;
    for node in &cluster.nodes {
        wait_until("message log to drain", || async move { pending_messages(node).await == 0 }).await;
    }

    cluster.network.set_blocked("mem://node2", true).expect("block");
    let mut options = cluster.join_options("node3", first);
    // Skip zone probing, which would ping the unreachable node2.
    options.latency_zone = Some("default".to_owned());
    let third = cluster.start(options).await;

    let node1 = cluster.node(first);
    let node3_group = cluster.node(third).message_group_id().to_owned();
    wait_until("node3's peers to reach node1", || {
        let node3_group = node3_group.clone();
        async move {
            node1
                .context()
                .raft_groups()
                .get_raft_group_by_id(&node3_group)
                .await
                .expect("lookup")
                .is_some_and(|group| group.member_ids().len() == 3)
        }
    })
    .await;
    wait_until("sync messages to queue", || async move { pending_messages(node1).await >= 3 }).await;
    assert_eq!(node_count(cluster.node(1)).await, 2);
    cluster
}

#[tokio::test]
async fn test_resend_delivers_after_link_heals() {
    let cluster = partitioned_cluster().await;
    let (node1, node2) = (cluster.node(0), cluster.node(1));

    cluster.network.set_blocked("mem://node2", false).expect("unblock");
    let resend_age = node1.messaging().config().resend_age;
    cluster
        .time
        .advance(u64::try_from(resend_age.as_millis()).expect("fits") + 1000);
    node1.messaging().house_keeping().await.expect("house keeping");

    wait_until("node2 to learn about node3", || async move { node_count(node2).await == 3 }).await;
    wait_until("node1's log to drain", || async move { pending_messages(node1).await == 0 }).await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_messages_are_dropped() {
    let cluster = partitioned_cluster().await;
    let (node1, node2) = (cluster.node(0), cluster.node(1));
    let messaging = node1.messaging();

    // One tick per retry, and one more to drop.
    for _ in 0..=messaging.config().max_resends {
        cluster.time.advance(2000);
        messaging.house_keeping().await.expect("house keeping");
    }

    let message_group = messaging.message_group();
    assert!(message_group.get_unacknowledged_messages().await.expect("scan").is_empty());
    assert!(message_group.get_exhausted_messages().await.expect("scan").is_empty());

    // Healing the link no longer helps.
    cluster.network.set_blocked("mem://node2", false).expect("unblock");
    messaging.house_keeping().await.expect("house keeping");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(node_count(node2).await, 2);

    cluster.shutdown().await;
}
