//! A node's view of the cluster: one cache per system table.
//!
//! Changes flow through [`NodeContext::update_system`]: the node applies the
//! change locally, then sends an `UPDATE_TABLE` to the raft group of every
//! partition covering the row's key. The receiving member applies it and
//! fans it out to the rest of the cluster as `CACHE_SYNC`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::cache::nodes::NodesCache;
use crate::cache::partitions::{PartitionGroupRecord, PartitionGroupsCache};
use crate::cache::raft_groups::{PARTITION_GROUP_TYPE, RaftGroupRecord, RaftGroupsCache};
use crate::cache::schema::{CODE, CODE_CACHE, SYSTEM_TABLES};
use crate::cache::system_cache::{CacheError, SystemCache};
use crate::cache::tables::{TableRecord, TablesCache};
use crate::messaging::envelope::UPDATE_TABLE;
use crate::messaging::layer::MessagingLayer;
use crate::replication::executor::Row;
use crate::time::TimeSource;

/// Payload of `UPDATE_TABLE` and `CACHE_SYNC`. A `None` value deletes the
/// row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdate {
    pub cache_name: String,
    pub key: String,
    pub value: Option<Row>,
    /// The partition the update was routed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_id: Option<String>,
}

#[derive(Debug)]
pub struct NodeContext {
    nodes: NodesCache,
    raft_groups: RaftGroupsCache,
    partitions: PartitionGroupsCache,
    tables: TablesCache,
    code: SystemCache,
}

impl NodeContext {
    /// Empty caches for every system table.
    pub async fn new() -> Result<Self, CacheError> {
        Ok(Self {
            nodes: NodesCache::new().await?,
            raft_groups: RaftGroupsCache::new().await?,
            partitions: PartitionGroupsCache::new().await?,
            tables: TablesCache::new().await?,
            code: SystemCache::new(CODE_CACHE, &CODE).await?,
        })
    }

    #[must_use]
    pub const fn nodes(&self) -> &NodesCache {
        &self.nodes
    }

    #[must_use]
    pub const fn raft_groups(&self) -> &RaftGroupsCache {
        &self.raft_groups
    }

    #[must_use]
    pub const fn partitions(&self) -> &PartitionGroupsCache {
        &self.partitions
    }

    #[must_use]
    pub const fn tables(&self) -> &TablesCache {
        &self.tables
    }

    #[must_use]
    pub const fn code(&self) -> &SystemCache {
        &self.code
    }

    /// Look up a cache by the name carried in updates.
    #[must_use]
    pub fn cache(&self, cache_name: &str) -> Option<&SystemCache> {
        [
            self.tables.cache(),
            self.partitions.cache(),
            self.raft_groups.cache(),
            self.nodes.cache(),
            &self.code,
        ]
        .into_iter()
        .find(|cache| cache.cache_name() == cache_name)
    }

    fn cache_or_err(&self, cache_name: &str) -> Result<&SystemCache, CacheError> {
        self.cache(cache_name)
            .ok_or_else(|| CacheError::UnknownCache(cache_name.to_owned()))
    }

    /// Every cache, as cache name to serialized rows.
    pub async fn serialize_all(&self) -> Result<Value, CacheError> {
        let mut snapshot = Map::new();
        for (cache_name, _) in SYSTEM_TABLES {
            let serialized = self.cache_or_err(cache_name)?.serialize().await?;
            snapshot.insert(cache_name.to_owned(), Value::String(serialized));
        }
        Ok(Value::Object(snapshot))
    }

    /// Load a [`serialize_all`](Self::serialize_all) snapshot. Caches missing
    /// from the snapshot are left alone.
    pub async fn populate_all(&self, snapshot: &Value) -> Result<(), CacheError> {
        for (cache_name, _) in SYSTEM_TABLES {
            if let Some(serialized) = snapshot.get(cache_name).and_then(Value::as_str) {
                self.cache_or_err(cache_name)?.load_serialized(serialized).await?;
            }
        }
        Ok(())
    }

    /// Bootstrap the first node of a cluster: register every system table,
    /// each with one whole-table partition replicated by `node_id` alone.
    pub async fn create_system_tables(&self, node_id: &str, time: &dyn TimeSource) -> Result<(), CacheError> {
        let now = time.now_ms().to_string();
        let members = [node_id.to_owned()];
        for (cache_name, schema) in SYSTEM_TABLES {
            let table_id = Uuid::new_v4().to_string();
            let partition_id = Uuid::new_v4().to_string();

            self.tables
                .add_table(&TableRecord {
                    id: table_id.clone(),
                    name: schema.table_name.to_owned(),
                    schema: Some(cache_name.to_owned()),
                    created_at: Some(now.clone()),
                    modified_at: Some(now.clone()),
                    created_by: Some(node_id.to_owned()),
                })
                .await?;
            self.partitions
                .add_partition_group(&PartitionGroupRecord::whole_table(&partition_id, table_id, &members))
                .await?;
            self.raft_groups
                .add_raft_group(&RaftGroupRecord::new(partition_id, PARTITION_GROUP_TYPE, &members))
                .await?;
        }
        tracing::info!(node_id, "created system tables");
        Ok(())
    }

    /// Apply an update to the local cache.
    pub async fn apply_update(&self, update: &TableUpdate) -> Result<(), CacheError> {
        let cache = self.cache_or_err(&update.cache_name)?;
        match &update.value {
            Some(row) => cache.add_item(row).await,
            None => cache.remove_item(&update.key).await.map(|_| ()),
        }
    }

    /// Set row `key` of `cache_name` to `value` (or delete it) locally, then
    /// route the change to every partition covering `key`.
    ///
    /// # Errors
    ///
    /// Fails if the cache or its table is unknown, or if a partition's raft
    /// group cannot be reached.
    pub async fn update_system(
        &self,
        layer: &MessagingLayer,
        cache_name: &str,
        key: &str,
        value: Option<Row>,
    ) -> Result<(), CacheError> {
        let cache = self.cache_or_err(cache_name)?;
        let table_name = cache.schema().table_name;
        let mut update = TableUpdate {
            cache_name: cache_name.to_owned(),
            key: key.to_owned(),
            value,
            partition_id: None,
        };
        self.apply_update(&update).await?;

        let table_id = self
            .tables
            .table_id_by_name(table_name)
            .await?
            .ok_or_else(|| CacheError::UnknownTable(table_name.to_owned()))?;
        let partitions = self.partitions.partitions_for_key(&table_id, key).await?;
        if partitions.is_empty() {
            tracing::warn!(cache_name, key, "no partition covers key");
        }

        for partition in partitions {
            update.partition_id = Some(partition.id.clone());
            let message = layer.create_command(UPDATE_TABLE, json!(update));
            layer
                .send_message_to_raft_group(self, message, Value::Null, None, &partition.id)
                .await?;
        }
        Ok(())
    }
}
