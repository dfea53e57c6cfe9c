//! Node bootstrap and lifecycle.
//!
//! # Startup
//!
//! 1. Open the node's message group and messaging layer.
//! 2. Serve `GET_PEER_DATA` with a snapshot of every system cache.
//! 3. Join: fetch a snapshot from `existing_node`. First node: create the
//!    system tables, each with one whole-table partition owned by this node.
//! 4. Pick a latency zone, then register the node and its message group.
//! 5. Add up to `replication_factor - 1` peers to the message group, own
//!    latency zone first.
//!
//! Any failing step fails the start.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::cache::context::{NodeContext, TableUpdate};
use crate::cache::nodes::NodeRecord;
use crate::cache::raft_groups::{MESSAGES_GROUP_TYPE, RaftGroupRecord};
use crate::cache::schema::{NODES_CACHE, RAFT_GROUPS_CACHE, SYSTEM_TABLES, TableSchema};
use crate::cache::system_cache::{CacheError, to_row};
use crate::config::{MessagingConfig, NodeConfig};
use crate::grammar::{SqlGrammar, StatementGrammar};
use crate::messaging::envelope::{CACHE_SYNC, GET_PEER_DATA, UPDATE_TABLE};
use crate::messaging::layer::{MessagingError, MessagingLayer};
use crate::messaging::transport::Transport;
use crate::partition_layer::{
    LiveQueryUpdate, PartitionError, PartitionLayer, PartitionRouter, listen_for_live_query_updates,
};
use crate::replication::executor::{ExecutorError, ExecutorFactory, Row};
use crate::replication::group::{GroupError, ReplicatedGroup};
use crate::replication::message_group::MessageGroup;
use crate::time::{SystemTimeSource, TimeSource};

/// A joining node adopts the closest zone only if it answers this fast.
pub const LATENCY_ZONE_THRESHOLD: Duration = Duration::from_millis(30);

/// Everything [`Node::start`] needs.
pub struct NodeOptions {
    pub transport: Arc<dyn Transport>,
    pub executor_factory: Arc<dyn ExecutorFactory>,
    /// Address of a running node to join. `None` starts a new cluster.
    pub existing_node: Option<String>,
    /// `None` picks the closest zone on join, [`NodeConfig::DEFAULT_LATENCY_ZONE`]
    /// for the first node.
    pub latency_zone: Option<String>,
    pub replication_factor: usize,
    pub messaging: MessagingConfig,
    pub time: Arc<dyn TimeSource>,
    pub grammar: Arc<dyn StatementGrammar>,
    pub free_mem: f64,
    pub free_cpu: f64,
}

impl fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeOptions")
            .field("address", &self.transport.address())
            .field("existing_node", &self.existing_node)
            .field("latency_zone", &self.latency_zone)
            .field("replication_factor", &self.replication_factor)
            .field("messaging", &self.messaging)
            .finish_non_exhaustive()
    }
}

impl NodeOptions {
    /// Defaults for a first node on `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, executor_factory: Arc<dyn ExecutorFactory>) -> Self {
        Self {
            transport,
            executor_factory,
            existing_node: None,
            latency_zone: None,
            replication_factor: NodeConfig::DEFAULT_REPLICATION_FACTOR,
            messaging: MessagingConfig::default(),
            time: Arc::new(SystemTimeSource),
            grammar: Arc::new(SqlGrammar),
            free_mem: 0.0,
            free_cpu: 0.0,
        }
    }

    #[must_use]
    pub fn from_config(
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        executor_factory: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            existing_node: config.existing_node.clone(),
            latency_zone: config.latency_zone.clone(),
            replication_factor: config.replication_factor,
            messaging: config.messaging,
            ..Self::new(transport, executor_factory)
        }
    }
}

/// A running node.
pub struct Node {
    id: String,
    latency_zone: String,
    message_group_id: String,
    context: Arc<NodeContext>,
    messaging: Arc<MessagingLayer>,
    partitions: Arc<PartitionRouter>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("latency_zone", &self.latency_zone)
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub async fn start(options: NodeOptions) -> Result<Self, NodeError> {
        let id = Uuid::new_v4().to_string();
        let address = options.transport.address().to_owned();
        tracing::info!(node_id = %id, %address, existing_node = ?options.existing_node, "starting node");

        let message_group_id = format!("messages-{id}");
        let executor = options.executor_factory.create(&message_group_id).await?;
        let group = ReplicatedGroup::new(&message_group_id, [address.clone()], executor)?;
        let message_group = MessageGroup::open(group, &options.messaging, Arc::clone(&options.time)).await?;
        let messaging = MessagingLayer::new(
            Arc::clone(&options.transport),
            message_group,
            options.messaging,
            Arc::clone(&options.time),
        )?;
        let context = Arc::new(NodeContext::new().await?);
        let partitions = PartitionRouter::install(&messaging)?;
        listen_for_live_query_updates(&messaging, |update| async move {
            tracing::debug!(
                subscription = %update.subscription_id,
                partition_id = %update.partition_id,
                "live query update"
            );
            Ok(())
        })?;

        listen_for_peer_data(&messaging, &context)?;
        listen_for_table_updates(&messaging, &context, &partitions, &id)?;

        let latency_zone = if let Some(existing) = &options.existing_node {
            let request = messaging.create_command(GET_PEER_DATA, json!({}));
            let snapshot = messaging.send_rpc(request, existing, Value::Null, None).await?;
            context.populate_all(&snapshot.data).await?;
            tracing::info!(node_id = %id, %existing, "loaded peer data");
            match options.latency_zone {
                Some(zone) => zone,
                None => choose_latency_zone(&context, &messaging).await?,
            }
        } else {
            context.create_system_tables(&id, options.time.as_ref()).await?;
            options
                .latency_zone
                .unwrap_or_else(|| NodeConfig::DEFAULT_LATENCY_ZONE.to_owned())
        };

        for partition in context.partitions().owned_by(&id).await? {
            let table = match context.tables().get_table_by_id(&partition.table_id).await? {
                Some(table) => system_table(&table.name),
                None => None,
            };
            let executor = options.executor_factory.create(&partition.id).await?;
            let group = ReplicatedGroup::new(&partition.id, [address.clone()], executor)?;
            let layer = PartitionLayer::open(
                &partition.id,
                group,
                Arc::clone(&options.grammar),
                Arc::clone(&messaging),
                table,
            )
            .await?;
            partitions.add(layer)?;
        }

        let node = Self {
            id,
            latency_zone,
            message_group_id,
            context,
            messaging,
            partitions,
        };

        let record = NodeRecord {
            id: node.id.clone(),
            external_address: address,
            latency_zone: node.latency_zone.clone(),
            free_mem: options.free_mem,
            free_cpu: options.free_cpu,
        };
        node.update(NODES_CACHE, &node.id, to_row(&record)?).await?;
        let message_group = RaftGroupRecord::new(&node.message_group_id, MESSAGES_GROUP_TYPE, &[node.id.clone()]);
        node.update(RAFT_GROUPS_CACHE, &node.message_group_id, to_row(&message_group)?)
            .await?;

        node.discover_peers(options.replication_factor).await?;
        tracing::info!(node_id = %node.id, zone = %node.latency_zone, "node started");
        Ok(node)
    }

    async fn update(&self, cache_name: &str, key: &str, row: Row) -> Result<(), NodeError> {
        self.context
            .update_system(&self.messaging, cache_name, key, Some(row))
            .await?;
        Ok(())
    }

    /// Add the nearest known nodes to this node's message group.
    async fn discover_peers(&self, replication_factor: usize) -> Result<(), NodeError> {
        let nodes = self.context.nodes();
        let mut candidates = nodes.nodes_in_zone(&self.latency_zone).await?;
        candidates.extend(
            nodes
                .all_nodes()
                .await?
                .into_iter()
                .filter(|node| node.latency_zone != self.latency_zone),
        );
        let peers: Vec<NodeRecord> = candidates
            .into_iter()
            .filter(|node| node.id != self.id)
            .take(replication_factor.saturating_sub(1))
            .collect();
        if peers.is_empty() {
            return Ok(());
        }

        let group = self.messaging.message_group().group();
        let mut members = vec![self.id.clone()];
        for peer in peers {
            group.add_member(&peer.external_address).await?;
            tracing::debug!(node_id = %self.id, peer = %peer.id, "added peer to message group");
            members.push(peer.id);
        }
        let record = RaftGroupRecord::new(&self.message_group_id, MESSAGES_GROUP_TYPE, &members);
        self.update(RAFT_GROUPS_CACHE, &self.message_group_id, to_row(&record)?)
            .await
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn address(&self) -> &str {
        self.messaging.address()
    }

    #[must_use]
    pub fn latency_zone(&self) -> &str {
        &self.latency_zone
    }

    #[must_use]
    pub fn message_group_id(&self) -> &str {
        &self.message_group_id
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    #[must_use]
    pub const fn messaging(&self) -> &Arc<MessagingLayer> {
        &self.messaging
    }

    /// Partitions replicated by this node.
    #[must_use]
    pub const fn partitions(&self) -> &Arc<PartitionRouter> {
        &self.partitions
    }

    /// Handle `LIVE_QUERY_UPDATE`s for subscriptions naming this node as a
    /// recipient. Replaces the default handler, which only logs. Updates
    /// are acknowledged once `handler` succeeds.
    pub fn on_live_query_update<F, Fut>(&self, handler: F) -> Result<(), NodeError>
    where
        F: Fn(LiveQueryUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
    {
        listen_for_live_query_updates(&self.messaging, handler)?;
        Ok(())
    }

    /// Close partition groups, then messaging. Pending RPCs are cancelled.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        tracing::info!(node_id = %self.id, "shutting down node");
        self.partitions.close().await?;
        self.messaging.close().await?;
        Ok(())
    }
}

fn system_table(name: &str) -> Option<&'static TableSchema> {
    SYSTEM_TABLES
        .iter()
        .find(|(_, schema)| schema.table_name == name)
        .map(|(_, schema)| *schema)
}

async fn choose_latency_zone(context: &NodeContext, messaging: &MessagingLayer) -> Result<String, NodeError> {
    match context.nodes().closest_latency_zone(messaging).await? {
        Some((zone, rtt)) if rtt <= LATENCY_ZONE_THRESHOLD => {
            tracing::debug!(%zone, ?rtt, "joining closest latency zone");
            Ok(zone)
        }
        closest => {
            let zone = Uuid::new_v4().to_string();
            tracing::info!(?closest, %zone, "no latency zone close enough, starting a new one");
            Ok(zone)
        }
    }
}

fn listen_for_peer_data(messaging: &Arc<MessagingLayer>, context: &Arc<NodeContext>) -> Result<(), MessagingError> {
    let weak = Arc::downgrade(messaging);
    let context = Arc::clone(context);
    messaging.listen_for(GET_PEER_DATA, move |message| {
        let (weak, context) = (Weak::clone(&weak), Arc::clone(&context));
        async move {
            let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
            let snapshot = context.serialize_all().await?;
            layer.reply(&message, snapshot).await
        }
    })
}

/// `UPDATE_TABLE`: apply, acknowledge, then forward to every other node as
/// `CACHE_SYNC`. `CACHE_SYNC`: apply and acknowledge.
fn listen_for_table_updates(
    messaging: &Arc<MessagingLayer>,
    context: &Arc<NodeContext>,
    partitions: &Arc<PartitionRouter>,
    node_id: &str,
) -> Result<(), MessagingError> {
    let weak = Arc::downgrade(messaging);
    let weak_partitions = Arc::downgrade(partitions);
    let update_context = Arc::clone(context);
    let node_id = node_id.to_owned();
    messaging.listen_for(UPDATE_TABLE, move |message| {
        let (weak, weak_partitions, context, node_id) = (
            Weak::clone(&weak),
            Weak::clone(&weak_partitions),
            Arc::clone(&update_context),
            node_id.clone(),
        );
        async move {
            let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
            let mut update: TableUpdate = serde_json::from_value(message.data.clone())?;
            context.apply_update(&update).await?;

            if let Some(partition_id) = &update.partition_id
                && let Some(partition) = weak_partitions
                    .upgrade()
                    .and_then(|partitions| partitions.get(partition_id))
                && let Err(e) = partition.apply_table_update(&update).await
            {
                tracing::warn!(%partition_id, "failed to store update in partition: {e}");
            }
            layer.reply(&message, json!({})).await?;

            let destinations: Vec<String> = context
                .nodes()
                .all_nodes()
                .await?
                .into_iter()
                .filter(|node| {
                    node.id != node_id
                        && node.external_address != message.source
                        && node.external_address != layer.address()
                })
                .map(|node| node.external_address)
                .collect();
            update.partition_id = None;
            layer.broadcast(CACHE_SYNC, &json!(update), &destinations).await
        }
    })?;

    let weak = Arc::downgrade(messaging);
    let sync_context = Arc::clone(context);
    messaging.listen_for(CACHE_SYNC, move |message| {
        let (weak, context) = (Weak::clone(&weak), Arc::clone(&sync_context));
        async move {
            let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
            let update: TableUpdate = serde_json::from_value(message.data.clone())?;
            context.apply_update(&update).await?;
            layer.reply(&message, json!({})).await
        }
    })
}

/// Errors returned while starting or stopping a node.
#[derive(Debug)]
pub enum NodeError {
    Executor(ExecutorError),
    Group(GroupError),
    Messaging(MessagingError),
    Cache(CacheError),
    Partition(PartitionError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executor(e) => write!(f, "executor error: {e}"),
            Self::Group(e) => write!(f, "group error: {e}"),
            Self::Messaging(e) => write!(f, "messaging error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Partition(e) => write!(f, "partition error: {e}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Executor(e) => Some(e),
            Self::Group(e) => Some(e),
            Self::Messaging(e) => Some(e),
            Self::Cache(e) => Some(e),
            Self::Partition(e) => Some(e),
        }
    }
}

impl From<ExecutorError> for NodeError {
    fn from(e: ExecutorError) -> Self {
        Self::Executor(e)
    }
}

impl From<GroupError> for NodeError {
    fn from(e: GroupError) -> Self {
        Self::Group(e)
    }
}

impl From<MessagingError> for NodeError {
    fn from(e: MessagingError) -> Self {
        Self::Messaging(e)
    }
}

impl From<CacheError> for NodeError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<PartitionError> for NodeError {
    fn from(e: PartitionError) -> Self {
        Self::Partition(e)
    }
}
