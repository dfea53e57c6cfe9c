//! The `partitiongroup` table: which raft group owns which key span of
//! which table.
//!
//! Spans are half-open, `[spanStart, spanEnd)`, compared as strings. A
//! missing bound is unbounded on that side.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::raft_groups::split_members;
use crate::cache::schema::{PARTITION_GROUPS, PARTITIONS_CACHE};
use crate::cache::system_cache::{CacheError, SystemCache, from_row, to_row};
use crate::replication::executor::Query;

/// A row of the `partitiongroup` table. `id` is also the id of the raft
/// group replicating the partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionGroupRecord {
    pub id: String,
    pub table_id: String,
    pub members: String,
    pub parent_partition: Option<String>,
    pub child_partitions: Option<String>,
    pub span_start: Option<String>,
    pub span_end: Option<String>,
}

impl PartitionGroupRecord {
    /// A root partition covering every key of `table_id`.
    #[must_use]
    pub fn whole_table(id: impl Into<String>, table_id: impl Into<String>, members: &[String]) -> Self {
        Self {
            id: id.into(),
            table_id: table_id.into(),
            members: members.join(","),
            parent_partition: None,
            child_partitions: None,
            span_start: None,
            span_end: None,
        }
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        split_members(&self.members)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.span_start.as_deref().is_none_or(|start| start <= key)
            && self.span_end.as_deref().is_none_or(|end| key < end)
    }
}

#[derive(Debug)]
pub struct PartitionGroupsCache {
    cache: SystemCache,
}

impl PartitionGroupsCache {
    pub async fn new() -> Result<Self, CacheError> {
        Ok(Self {
            cache: SystemCache::new(PARTITIONS_CACHE, &PARTITION_GROUPS).await?,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &SystemCache {
        &self.cache
    }

    pub async fn add_partition_group(&self, partition: &PartitionGroupRecord) -> Result<(), CacheError> {
        self.cache.add_item(&to_row(partition)?).await
    }

    pub async fn get_partition_group_by_id(&self, id: &str) -> Result<Option<PartitionGroupRecord>, CacheError> {
        self.cache.get(id).await?.map(from_row).transpose()
    }

    pub async fn partitions_for_table(&self, table_id: &str) -> Result<Vec<PartitionGroupRecord>, CacheError> {
        self.cache
            .find_by("tableId", &json!(table_id))
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    /// Partitions of `table_id` whose span contains `key`.
    pub async fn partitions_for_key(
        &self,
        table_id: &str,
        key: &str,
    ) -> Result<Vec<PartitionGroupRecord>, CacheError> {
        let query = Query::with_params(
            "SELECT * FROM \"partitiongroup\" WHERE \"tableId\" = ? \
             AND (\"spanStart\" IS NULL OR \"spanStart\" <= ?) \
             AND (\"spanEnd\" IS NULL OR \"spanEnd\" > ?) \
             ORDER BY \"id\"",
            vec![json!(table_id), json!(key), json!(key)],
        );
        self.cache.query(query).await?.into_iter().map(from_row).collect()
    }

    /// Partitions that list `node_id` among their members.
    pub async fn owned_by(&self, node_id: &str) -> Result<Vec<PartitionGroupRecord>, CacheError> {
        let all: Vec<PartitionGroupRecord> = self
            .cache
            .get_all()
            .await?
            .into_iter()
            .map(from_row)
            .collect::<Result<_, _>>()?;
        Ok(all
            .into_iter()
            .filter(|partition| partition.member_ids().iter().any(|id| id == node_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: &str, start: Option<&str>, end: Option<&str>) -> PartitionGroupRecord {
        PartitionGroupRecord {
            span_start: start.map(str::to_owned),
            span_end: end.map(str::to_owned),
            ..PartitionGroupRecord::whole_table(id, "t1", &["n1".to_owned()])
        }
    }

    #[test]
    fn test_contains_key_is_half_open() {
        let partition = span("p", Some("b"), Some("d"));
        assert!(!partition.contains_key("a"));
        assert!(partition.contains_key("b"));
        assert!(partition.contains_key("c"));
        assert!(!partition.contains_key("d"));
        assert!(span("all", None, None).contains_key(""));
    }

    #[tokio::test]
    async fn test_partitions_for_key_matches_contains_key() {
        let cache = PartitionGroupsCache::new().await.expect("cache");
        let partitions = [
            span("p1", None, Some("g")),
            span("p2", Some("g"), Some("p")),
            span("p3", Some("p"), None),
        ];
        for partition in &partitions {
            cache.add_partition_group(partition).await.expect("add");
        }
        cache
            .add_partition_group(&PartitionGroupRecord::whole_table("other", "t2", &["n2".to_owned()]))
            .await
            .expect("add");

        for key in ["a", "g", "k", "p", "z"] {
            let found = cache.partitions_for_key("t1", key).await.expect("lookup");
            let expected: Vec<&PartitionGroupRecord> =
                partitions.iter().filter(|p| p.contains_key(key)).collect();
            assert_eq!(found.iter().collect::<Vec<_>>(), expected, "key {key}");
        }
    }

    #[tokio::test]
    async fn test_owned_by() {
        let cache = PartitionGroupsCache::new().await.expect("cache");
        cache
            .add_partition_group(&PartitionGroupRecord::whole_table(
                "p1",
                "t1",
                &["n1".to_owned(), "n2".to_owned()],
            ))
            .await
            .expect("add");
        cache
            .add_partition_group(&PartitionGroupRecord::whole_table("p2", "t2", &["n2".to_owned()]))
            .await
            .expect("add");

        let owned: Vec<String> = cache
            .owned_by("n1")
            .await
            .expect("owned")
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(owned, ["p1"]);
        assert_eq!(cache.owned_by("n2").await.expect("owned").len(), 2);
        assert_eq!(cache.partitions_for_table("t2").await.expect("table").len(), 1);
    }
}
