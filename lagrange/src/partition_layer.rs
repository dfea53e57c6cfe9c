//! Query execution and live-query notification for the partitions a node
//! replicates.
//!
//! Each [`PartitionLayer`] fronts one partition's replicated group. Writes
//! that go through [`PartitionLayer::query`] are classified by the grammar;
//! every live query whose columns the write touches gets a
//! `LIVE_QUERY_UPDATE` sent to each of its recipients.
//!
//! Remote nodes reach a partition through the [`PartitionRouter`], which
//! owns the `PARTITION_*` handlers and dispatches on `partitionId`.
//! Recipients consume updates with [`listen_for_live_query_updates`], which
//! acknowledges each one once its handler succeeds.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cache::context::TableUpdate;
use crate::cache::schema::{LIVE_QUERY_SUBSCRIBERS, TableSchema};
use crate::grammar::{GrammarError, ParsedStatement, StatementGrammar};
use crate::messaging::envelope::{
    LIVE_QUERY_UPDATE, Message, PARTITION_DEREGISTER_LIVE_QUERY, PARTITION_QUERY, PARTITION_REGISTER_LIVE_QUERY,
};
use crate::messaging::layer::{MessagingError, MessagingLayer};
use crate::replication::executor::{Query, Row};
use crate::replication::group::{GroupError, ReplicatedGroup};

/// Payload of `LIVE_QUERY_UPDATE`: a write on `partition_id` touched the
/// columns of subscription `subscription_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQueryUpdate {
    pub subscription_id: String,
    pub partition_id: String,
    pub sql: String,
    pub params: Vec<Value>,
    /// Rows the write returned (`RETURNING`), usually empty.
    #[serde(default)]
    pub rows: Vec<Row>,
}

/// A live query registered on a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveQuerySubscription {
    pub id: String,
    /// Lowercased column names.
    pub columns: Vec<String>,
    /// Addresses notified on a matching write.
    pub recipients: Vec<String>,
}

impl LiveQuerySubscription {
    fn from_row(row: &Row) -> Result<Self, PartitionError> {
        let text = |column: &str| row.get(column).and_then(Value::as_str).unwrap_or("[]");
        Ok(Self {
            id: row
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            columns: serde_json::from_str(text("columns"))?,
            recipients: serde_json::from_str(text("recipients"))?,
        })
    }
}

/// Queries and live queries on one partition.
pub struct PartitionLayer {
    partition_id: String,
    group: ReplicatedGroup,
    grammar: Arc<dyn StatementGrammar>,
    messaging: Arc<MessagingLayer>,
    table: Option<&'static TableSchema>,
}

impl fmt::Debug for PartitionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionLayer")
            .field("partition_id", &self.partition_id)
            .field("group", &self.group)
            .field("table", &self.table.map(|schema| schema.table_name))
            .finish_non_exhaustive()
    }
}

impl PartitionLayer {
    /// Create the subscriptions table, and `table` if given, in `group`.
    pub async fn open(
        partition_id: impl Into<String>,
        group: ReplicatedGroup,
        grammar: Arc<dyn StatementGrammar>,
        messaging: Arc<MessagingLayer>,
        table: Option<&'static TableSchema>,
    ) -> Result<Arc<Self>, PartitionError> {
        let statements = LIVE_QUERY_SUBSCRIBERS
            .create_statements()
            .into_iter()
            .chain(table.map(TableSchema::create_statements).unwrap_or_default());
        for statement in statements {
            group.execute(&Query::new(statement)).await?;
        }
        Ok(Arc::new(Self {
            partition_id: partition_id.into(),
            group,
            grammar,
            messaging,
            table,
        }))
    }

    #[must_use]
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    #[must_use]
    pub const fn group(&self) -> &ReplicatedGroup {
        &self.group
    }

    /// Table stored in this partition, if any.
    #[must_use]
    pub const fn table(&self) -> Option<&'static TableSchema> {
        self.table
    }

    /// Run `sql` against the partition and notify live queries it affects.
    ///
    /// # Errors
    ///
    /// Fails if the statement cannot be classified or the group rejects
    /// it. Notification failures are logged, not returned.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, PartitionError> {
        let statement = self.grammar.parse(sql)?;
        let rows = self.group.execute(&Query::with_params(sql, params.clone())).await?;
        if statement.kind.is_mutating() {
            self.notify_live_queries(&statement, sql, &params, &rows).await?;
        }
        Ok(rows)
    }

    /// Write a system-table change into the partition's copy of the table.
    pub async fn apply_table_update(&self, update: &TableUpdate) -> Result<(), PartitionError> {
        let schema = self
            .table
            .ok_or_else(|| PartitionError::NoTable(self.partition_id.clone()))?;
        match &update.value {
            Some(row) => {
                let params = schema
                    .column_names()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect();
                self.query(&schema.upsert_sql(), params).await?;
            }
            None => {
                let sql = format!(
                    "DELETE FROM \"{}\" WHERE \"{}\" = ?",
                    schema.table_name, schema.primary_key
                );
                self.query(&sql, vec![json!(update.key)]).await?;
            }
        }
        Ok(())
    }

    pub async fn register_live_query(
        &self,
        id: &str,
        columns: &[String],
        recipients: &[String],
    ) -> Result<(), PartitionError> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
        self.group
            .execute(&Query::with_params(
                LIVE_QUERY_SUBSCRIBERS.upsert_sql(),
                vec![
                    json!(id),
                    json!(serde_json::to_string(&columns)?),
                    json!(serde_json::to_string(recipients)?),
                ],
            ))
            .await?;
        tracing::debug!(partition_id = %self.partition_id, id, "registered live query");
        Ok(())
    }

    /// Returns whether the subscription existed.
    pub async fn deregister_live_query(&self, id: &str) -> Result<bool, PartitionError> {
        let removed = self
            .group
            .execute(&Query::with_params(
                "DELETE FROM \"live_query_subscribers\" WHERE \"id\" = ? RETURNING \"id\"",
                vec![json!(id)],
            ))
            .await?;
        Ok(!removed.is_empty())
    }

    pub async fn live_queries(&self) -> Result<Vec<LiveQuerySubscription>, PartitionError> {
        self.group
            .execute(&Query::new("SELECT * FROM \"live_query_subscribers\" ORDER BY \"id\""))
            .await?
            .iter()
            .map(LiveQuerySubscription::from_row)
            .collect()
    }

    async fn notify_live_queries(
        &self,
        statement: &ParsedStatement,
        sql: &str,
        params: &[Value],
        rows: &[Row],
    ) -> Result<(), PartitionError> {
        for subscription in self.live_queries().await? {
            if !statement.touches_any(subscription.columns.iter().map(String::as_str)) {
                continue;
            }
            let update = LiveQueryUpdate {
                subscription_id: subscription.id.clone(),
                partition_id: self.partition_id.clone(),
                sql: sql.to_owned(),
                params: params.to_vec(),
                rows: rows.to_vec(),
            };
            let data = serde_json::to_value(&update)?;
            for recipient in &subscription.recipients {
                let message = self.messaging.create_command(LIVE_QUERY_UPDATE, data.clone());
                if let Err(e) = self
                    .messaging
                    .send_message_to_node(message, recipient, Value::Null, None)
                    .await
                {
                    tracing::warn!(%recipient, subscription = %subscription.id, "live query update failed: {e}");
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<(), PartitionError> {
        Ok(self.group.close().await?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    partition_id: String,
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    partition_id: String,
    id: String,
    columns: Vec<String>,
    recipients: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeregisterRequest {
    partition_id: String,
    id: String,
}

/// The partitions hosted by one node, reachable by `partitionId`.
#[derive(Default)]
pub struct PartitionRouter {
    layers: RwLock<HashMap<String, Arc<PartitionLayer>>>,
}

impl fmt::Debug for PartitionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self
            .layers
            .read()
            .map(|layers| layers.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("PartitionRouter").field("partitions", &ids).finish()
    }
}

impl PartitionRouter {
    /// Create a router and register its handlers on `messaging`.
    pub fn install(messaging: &Arc<MessagingLayer>) -> Result<Arc<Self>, PartitionError> {
        let router = Arc::new(Self::default());

        let (weak_router, weak_layer) = (Arc::downgrade(&router), Arc::downgrade(messaging));
        messaging.listen_for(PARTITION_QUERY, move |message| {
            let (router, layer) = (Weak::clone(&weak_router), Weak::clone(&weak_layer));
            async move {
                respond(&router, &layer, message, |router, data| async move {
                    let request: QueryRequest = serde_json::from_value(data)?;
                    let partition = router.require(&request.partition_id)?;
                    let rows = partition.query(&request.sql, request.params).await?;
                    Ok(json!({ "rows": rows }))
                })
                .await
            }
        })?;

        let (weak_router, weak_layer) = (Arc::downgrade(&router), Arc::downgrade(messaging));
        messaging.listen_for(PARTITION_REGISTER_LIVE_QUERY, move |message| {
            let (router, layer) = (Weak::clone(&weak_router), Weak::clone(&weak_layer));
            async move {
                respond(&router, &layer, message, |router, data| async move {
                    let request: RegisterRequest = serde_json::from_value(data)?;
                    router
                        .require(&request.partition_id)?
                        .register_live_query(&request.id, &request.columns, &request.recipients)
                        .await?;
                    Ok(json!({ "registered": true }))
                })
                .await
            }
        })?;

        let (weak_router, weak_layer) = (Arc::downgrade(&router), Arc::downgrade(messaging));
        messaging.listen_for(PARTITION_DEREGISTER_LIVE_QUERY, move |message| {
            let (router, layer) = (Weak::clone(&weak_router), Weak::clone(&weak_layer));
            async move {
                respond(&router, &layer, message, |router, data| async move {
                    let request: DeregisterRequest = serde_json::from_value(data)?;
                    let removed = router
                        .require(&request.partition_id)?
                        .deregister_live_query(&request.id)
                        .await?;
                    Ok(json!({ "removed": removed }))
                })
                .await
            }
        })?;

        Ok(router)
    }

    pub fn add(&self, layer: Arc<PartitionLayer>) -> Result<(), PartitionError> {
        self.layers
            .write()
            .map_err(|_| PartitionError::LockPoisoned)?
            .insert(layer.partition_id().to_owned(), layer);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, partition_id: &str) -> Option<Arc<PartitionLayer>> {
        self.layers
            .read()
            .ok()
            .and_then(|layers| layers.get(partition_id).cloned())
    }

    fn require(&self, partition_id: &str) -> Result<Arc<PartitionLayer>, PartitionError> {
        self.get(partition_id)
            .ok_or_else(|| PartitionError::UnknownPartition(partition_id.to_owned()))
    }

    /// Every hosted partition, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PartitionLayer>> {
        let mut layers: Vec<Arc<PartitionLayer>> = self
            .layers
            .read()
            .map(|layers| layers.values().cloned().collect())
            .unwrap_or_default();
        layers.sort_by(|a, b| a.partition_id().cmp(b.partition_id()));
        layers
    }

    /// Close and forget every partition.
    pub async fn close(&self) -> Result<(), PartitionError> {
        let layers = self.all();
        self.layers
            .write()
            .map_err(|_| PartitionError::LockPoisoned)?
            .clear();
        for layer in layers {
            layer.close().await?;
        }
        Ok(())
    }
}

/// Run `handle` and acknowledge `message` with its result, or with
/// `{"error": …}` if it fails.
async fn respond<F, Fut>(
    router: &Weak<PartitionRouter>,
    layer: &Weak<MessagingLayer>,
    message: Message,
    handle: F,
) -> Result<(), MessagingError>
where
    F: FnOnce(Arc<PartitionRouter>, Value) -> Fut,
    Fut: Future<Output = Result<Value, PartitionError>>,
{
    let layer = layer.upgrade().ok_or(MessagingError::Closed)?;
    let router = router.upgrade().ok_or(MessagingError::Closed)?;
    let result = match handle(router, message.data.clone()).await {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(name = %message.message_name, "partition request failed: {e}");
            json!({ "error": e.to_string() })
        }
    };
    layer.reply(&message, result).await
}

fn remote_result(ack: Message) -> Result<Value, MessagingError> {
    match ack.data.get("error").and_then(Value::as_str) {
        Some(error) => Err(MessagingError::Remote(error.to_owned())),
        None => Ok(ack.data),
    }
}

/// Route `LIVE_QUERY_UPDATE`s arriving at `messaging` to `handler`,
/// replacing any earlier handler.
///
/// # Post-conditions
///
/// An update is acknowledged only after `handler` returns `Ok`. A failing
/// handler leaves the update with the sender, which resends it.
pub fn listen_for_live_query_updates<F, Fut>(messaging: &Arc<MessagingLayer>, handler: F) -> Result<(), MessagingError>
where
    F: Fn(LiveQueryUpdate) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
{
    let weak = Arc::downgrade(messaging);
    let handler = Arc::new(handler);
    messaging.listen_for(LIVE_QUERY_UPDATE, move |message| {
        let (weak, handler) = (Weak::clone(&weak), Arc::clone(&handler));
        async move {
            let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
            let update: LiveQueryUpdate = serde_json::from_value(message.data.clone())?;
            handler(update).await?;
            layer.reply(&message, json!({})).await
        }
    })
}

/// Run `sql` on partition `partition_id` hosted at `destination`.
pub async fn query_remote_partition(
    messaging: &MessagingLayer,
    destination: &str,
    partition_id: &str,
    sql: &str,
    params: Vec<Value>,
) -> Result<Vec<Row>, MessagingError> {
    let message = messaging.create_command(
        PARTITION_QUERY,
        json!({ "partitionId": partition_id, "sql": sql, "params": params }),
    );
    let mut result = remote_result(messaging.send_rpc(message, destination, Value::Null, None).await?)?;
    let rows = result.get_mut("rows").map(Value::take).unwrap_or_default();
    Ok(serde_json::from_value(rows)?)
}

/// Subscribe `recipients` to writes touching `columns` of a remote partition.
pub async fn register_remote_live_query(
    messaging: &MessagingLayer,
    destination: &str,
    partition_id: &str,
    id: &str,
    columns: &[String],
    recipients: &[String],
) -> Result<(), MessagingError> {
    let message = messaging.create_command(
        PARTITION_REGISTER_LIVE_QUERY,
        json!({ "partitionId": partition_id, "id": id, "columns": columns, "recipients": recipients }),
    );
    remote_result(messaging.send_rpc(message, destination, Value::Null, None).await?)?;
    Ok(())
}

/// Remove a live query from a remote partition. Returns whether it existed.
pub async fn deregister_remote_live_query(
    messaging: &MessagingLayer,
    destination: &str,
    partition_id: &str,
    id: &str,
) -> Result<bool, MessagingError> {
    let message = messaging.create_command(
        PARTITION_DEREGISTER_LIVE_QUERY,
        json!({ "partitionId": partition_id, "id": id }),
    );
    let result = remote_result(messaging.send_rpc(message, destination, Value::Null, None).await?)?;
    Ok(result["removed"].as_bool().unwrap_or(false))
}

/// Errors returned by partition layers.
#[derive(Debug)]
pub enum PartitionError {
    /// No partition with this id is hosted here.
    UnknownPartition(String),
    /// The partition stores no table.
    NoTable(String),
    Grammar(GrammarError),
    Group(GroupError),
    Messaging(MessagingError),
    Codec(serde_json::Error),
    /// An internal lock was poisoned.
    LockPoisoned,
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPartition(id) => write!(f, "unknown partition: {id}"),
            Self::NoTable(id) => write!(f, "partition {id} stores no table"),
            Self::Grammar(e) => write!(f, "{e}"),
            Self::Group(e) => write!(f, "partition group error: {e}"),
            Self::Messaging(e) => write!(f, "messaging error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::LockPoisoned => write!(f, "partition lock poisoned"),
        }
    }
}

impl std::error::Error for PartitionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Grammar(e) => Some(e),
            Self::Group(e) => Some(e),
            Self::Messaging(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GrammarError> for PartitionError {
    fn from(e: GrammarError) -> Self {
        Self::Grammar(e)
    }
}

impl From<GroupError> for PartitionError {
    fn from(e: GroupError) -> Self {
        Self::Group(e)
    }
}

impl From<MessagingError> for PartitionError {
    fn from(e: MessagingError) -> Self {
        Self::Messaging(e)
    }
}

impl From<serde_json::Error> for PartitionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schema::NODES;
    use crate::config::MessagingConfig;
    use crate::grammar::SqlGrammar;
    use crate::messaging::transport::{MemoryNetwork, Transport};
    use crate::replication::executor::ReplicatedExecutor;
    use crate::replication::message_group::MessageGroup;
    use crate::replication::sqlite::SqliteExecutor;
    use crate::time::{ManualTimeSource, TimeSource};
    use std::sync::Mutex;
    use std::time::Duration;

    fn group(id: &str, member: &str) -> ReplicatedGroup {
        let executor = Arc::new(SqliteExecutor::open_in_memory().expect("open")) as Arc<dyn ReplicatedExecutor>;
        ReplicatedGroup::new(id, [member.to_owned()], executor).expect("group")
    }

    async fn layer(network: &Arc<MemoryNetwork>, name: &str) -> Arc<MessagingLayer> {
        let transport = network.transport(name);
        let config = MessagingConfig {
            housekeeping_interval: Duration::from_secs(3600),
            ..MessagingConfig::default()
        };
        let time: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::default_start());
        let message_group = MessageGroup::open(group(&format!("messages-{name}"), transport.address()), &config, Arc::clone(&time))
            .await
            .expect("message group");
        MessagingLayer::new(transport, message_group, config, time).expect("layer")
    }

    fn collect_updates(layer: &Arc<MessagingLayer>) -> Arc<Mutex<Vec<LiveQueryUpdate>>> {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        listen_for_live_query_updates(layer, move |update| {
            sink.lock().expect("lock").push(update);
            async { Ok(()) }
        })
        .expect("listen");
        updates
    }

    async fn eventually(updates: &Arc<Mutex<Vec<LiveQueryUpdate>>>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while updates.lock().expect("lock").len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("updates arrive");
    }

    #[tokio::test]
    async fn test_write_notifies_matching_subscriptions_only() {
        let network = MemoryNetwork::new();
        let host = layer(&network, "host").await;
        let watcher = layer(&network, "watcher").await;
        let updates = collect_updates(&watcher);

        let partition = PartitionLayer::open("p1", group("p1", "mem://host"), Arc::new(SqlGrammar), Arc::clone(&host), Some(&NODES))
            .await
            .expect("open");
        partition
            .register_live_query("mem-watch", &["freeMem".to_owned()], &["mem://watcher".to_owned()])
            .await
            .expect("register");
        partition
            .register_live_query("zone-watch", &["latencyZone".to_owned()], &["mem://watcher".to_owned()])
            .await
            .expect("register");

        partition
            .query(
                "INSERT INTO nodes (id, freeMem) VALUES (?, ?)",
                vec![json!("n1"), json!(4.0)],
            )
            .await
            .expect("insert");
        // Reads never notify.
        let rows = partition
            .query("SELECT id FROM nodes WHERE latencyZone IS NULL", vec![])
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);

        eventually(&updates, 1).await;
        let updates = updates.lock().expect("lock");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].subscription_id, "mem-watch");
        assert_eq!(updates[0].partition_id, "p1");
        assert_eq!(updates[0].params, [json!("n1"), json!(4.0)]);
    }

    #[tokio::test]
    async fn test_delivered_update_leaves_host_log() {
        let network = MemoryNetwork::new();
        let host = layer(&network, "host").await;
        let watcher = layer(&network, "watcher").await;
        let updates = collect_updates(&watcher);

        let partition = PartitionLayer::open("p1", group("p1", "mem://host"), Arc::new(SqlGrammar), Arc::clone(&host), Some(&NODES))
            .await
            .expect("open");
        partition
            .register_live_query("w", &["freeMem".to_owned()], &["mem://watcher".to_owned()])
            .await
            .expect("register");
        let rows = partition
            .query(
                "INSERT INTO nodes (id, freeMem) VALUES (?, ?) RETURNING id",
                vec![json!("n1"), json!(2.0)],
            )
            .await
            .expect("insert");
        assert_eq!(rows.len(), 1);

        eventually(&updates, 1).await;
        assert_eq!(updates.lock().expect("lock")[0].rows, rows);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !host
                .message_group()
                .get_unacknowledged_messages()
                .await
                .expect("scan")
                .is_empty()
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("host log drains");
    }

    #[tokio::test]
    async fn test_failing_handler_leaves_update_for_resend() {
        let network = MemoryNetwork::new();
        let host = layer(&network, "host").await;
        let watcher = layer(&network, "watcher").await;
        let attempts = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&attempts);
        listen_for_live_query_updates(&watcher, move |_| {
            *counter.lock().expect("lock") += 1;
            async { Err(MessagingError::Closed) }
        })
        .expect("listen");

        let partition = PartitionLayer::open("p1", group("p1", "mem://host"), Arc::new(SqlGrammar), Arc::clone(&host), Some(&NODES))
            .await
            .expect("open");
        partition
            .register_live_query("w", &["id".to_owned()], &["mem://watcher".to_owned()])
            .await
            .expect("register");
        partition
            .query("INSERT INTO nodes (id) VALUES (?)", vec![json!("n1")])
            .await
            .expect("insert");

        tokio::time::timeout(Duration::from_secs(5), async {
            while *attempts.lock().expect("lock") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("handler runs");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = host.message_group().get_unacknowledged_messages().await.expect("scan");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_name, LIVE_QUERY_UPDATE);
    }

    #[tokio::test]
    async fn test_deregistered_query_is_silent() {
        let network = MemoryNetwork::new();
        let host = layer(&network, "host").await;
        let partition = PartitionLayer::open("p1", group("p1", "mem://host"), Arc::new(SqlGrammar), host, Some(&NODES))
            .await
            .expect("open");

        partition
            .register_live_query("q", &["id".to_owned()], &["mem://nobody".to_owned()])
            .await
            .expect("register");
        assert_eq!(partition.live_queries().await.expect("list")[0].columns, ["id"]);
        assert!(partition.deregister_live_query("q").await.expect("deregister"));
        assert!(!partition.deregister_live_query("q").await.expect("deregister"));
        assert!(partition.live_queries().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_router_serves_remote_requests() {
        let network = MemoryNetwork::new();
        let host = layer(&network, "host").await;
        let client = layer(&network, "client").await;
        let updates = collect_updates(&client);

        let router = PartitionRouter::install(&host).expect("install");
        router
            .add(
                PartitionLayer::open("p1", group("p1", "mem://host"), Arc::new(SqlGrammar), Arc::clone(&host), Some(&NODES))
                    .await
                    .expect("open"),
            )
            .expect("add");

        register_remote_live_query(&client, "mem://host", "p1", "q1", &["id".to_owned()], &["mem://client".to_owned()])
            .await
            .expect("register");
        query_remote_partition(
            &client,
            "mem://host",
            "p1",
            "INSERT INTO nodes (id) VALUES (?)",
            vec![json!("n1")],
        )
        .await
        .expect("insert");
        let rows = query_remote_partition(&client, "mem://host", "p1", "SELECT id FROM nodes", vec![])
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("n1"));
        eventually(&updates, 1).await;

        assert!(
            deregister_remote_live_query(&client, "mem://host", "p1", "q1")
                .await
                .expect("deregister")
        );
        assert!(matches!(
            query_remote_partition(&client, "mem://host", "nope", "SELECT 1", vec![]).await,
            Err(MessagingError::Remote(error)) if error.contains("unknown partition")
        ));

        router.close().await.expect("close");
        assert!(router.all().is_empty());
    }
}
