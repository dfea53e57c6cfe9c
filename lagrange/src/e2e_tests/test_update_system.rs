//! Writes to a system table from any node reach every node.

use serde_json::json;

use crate::cache::schema::CODE_CACHE;
use crate::e2e_tests::helpers::{TestCluster, wait_until};
use crate::replication::executor::Row;

fn code_row(id: &str, body: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_owned(), json!(id));
    row.insert("name".to_owned(), json!("greet"));
    row.insert("type".to_owned(), json!("function"));
    row.insert("body".to_owned(), json!(body));
    row
}

#[tokio::test]
async fn test_code_update_propagates_and_deletes() {
    let mut cluster = TestCluster::new();
    let first = cluster.start_first("node1").await;
    cluster.join("node2", first).await;
    cluster.wait_for_node_count(2).await;
    let third = cluster.join("node3", first).await;
    cluster.wait_for_node_count(3).await;

    // Written on a node that owns no partition.
    let writer = cluster.node(third);
    writer
        .context()
        .update_system(writer.messaging(), CODE_CACHE, "fn-1", Some(code_row("fn-1", "return 1")))
        .await
        .expect("update");
    for node in &cluster.nodes {
        wait_until("code row to arrive", || async move {
            node.context()
                .code()
                .get("fn-1")
                .await
                .expect("get")
                .is_some_and(|row| row.get("body") == Some(&json!("return 1")))
        })
        .await;
    }

    writer
        .context()
        .update_system(writer.messaging(), CODE_CACHE, "fn-1", None)
        .await
        .expect("delete");
    for node in &cluster.nodes {
        wait_until("code row to disappear", || async move {
            node.context().code().get("fn-1").await.expect("get").is_none()
        })
        .await;
    }

    cluster.shutdown().await;
}
