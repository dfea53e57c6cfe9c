//! Common helpers for end-to-end tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::schema::PARTITIONS_CACHE;
use crate::config::MessagingConfig;
use crate::messaging::transport::MemoryNetwork;
use crate::node::{Node, NodeOptions};
use crate::replication::sqlite::SqliteExecutorFactory;
use crate::time::{ManualTimeSource, TimeSource};

/// Longest a test waits for the cluster to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Nodes sharing one in-process network and one manual clock.
pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub time: Arc<ManualTimeSource>,
    pub nodes: Vec<Node>,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            time: Arc::new(ManualTimeSource::default_start()),
            nodes: Vec::new(),
        }
    }

    /// Options for a node at `mem://{name}`, with housekeeping left to the
    /// test.
    #[must_use]
    pub fn options(&self, name: &str) -> NodeOptions {
        let mut options = NodeOptions::new(
            self.network.transport(name),
            Arc::new(SqliteExecutorFactory::in_memory()),
        );
        options.messaging = MessagingConfig {
            housekeeping_interval: Duration::from_secs(3600),
            rpc_timeout: Duration::from_secs(2),
            ..MessagingConfig::default()
        };
        options.time = Arc::clone(&self.time) as Arc<dyn TimeSource>;
        options
    }

    /// Start a node with `options`. Returns its index.
    pub async fn start(&mut self, options: NodeOptions) -> usize {
        let node = Node::start(options).await.expect("start node");
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Start the first node of the cluster.
    pub async fn start_first(&mut self, name: &str) -> usize {
        self.start(self.options(name)).await
    }

    /// Options for a node joining through node `via`.
    #[must_use]
    pub fn join_options(&self, name: &str, via: usize) -> NodeOptions {
        let mut options = self.options(name);
        options.existing_node = Some(self.nodes[via].address().to_owned());
        options
    }

    /// Start a node that joins through node `via`.
    pub async fn join(&mut self, name: &str, via: usize) -> usize {
        self.start(self.join_options(name, via)).await
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Wait until every node knows `count` nodes.
    pub async fn wait_for_node_count(&self, count: usize) {
        for node in &self.nodes {
            wait_until(&format!("{} to know {count} nodes", node.address()), || async move {
                node_count(node).await == count
            })
            .await;
        }
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await.expect("shutdown");
        }
    }
}

pub async fn node_count(node: &Node) -> usize {
    node.context()
        .nodes()
        .all_nodes()
        .await
        .expect("list nodes")
        .len()
}

/// Unacknowledged messages in `node`'s message log.
pub async fn pending_messages(node: &Node) -> usize {
    node.messaging()
        .message_group()
        .get_unacknowledged_messages()
        .await
        .expect("scan messages")
        .len()
}

/// Id of the partition holding system table `table_name`.
pub async fn partition_of(node: &Node, table_name: &str) -> String {
    let context = node.context();
    let table_id = context
        .tables()
        .table_id_by_name(table_name)
        .await
        .expect("lookup table")
        .expect("table registered");
    let partitions = context
        .partitions()
        .partitions_for_table(&table_id)
        .await
        .expect("lookup partitions");
    assert_eq!(partitions.len(), 1, "{PARTITIONS_CACHE} for {table_name}");
    partitions[0].id.clone()
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within [`SETTLE_TIMEOUT`].
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
