//! A node-local SQLite copy of one system table.
//!
//! Rows are JSON objects keyed by column name. Writes are upserts on the
//! primary key, so applying the same row twice is harmless. That lets a
//! node apply a change locally and again when it comes back over the
//! network.

use std::fmt;

use futures::future::try_join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::cache::schema::TableSchema;
use crate::messaging::layer::MessagingError;
use crate::replication::executor::{ExecutorError, Query, ReplicatedExecutor, Row};
use crate::replication::sqlite::SqliteExecutor;

/// Serialize a record into a cache row.
pub fn to_row<T: Serialize>(record: &T) -> Result<Row, CacheError> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(CacheError::NotARow(other.to_string())),
    }
}

/// Deserialize a cache row into a record.
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, CacheError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// One system table held in a private in-memory database.
pub struct SystemCache {
    cache_name: &'static str,
    schema: &'static TableSchema,
    store: SqliteExecutor,
}

impl fmt::Debug for SystemCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemCache")
            .field("cache_name", &self.cache_name)
            .field("table", &self.schema.table_name)
            .finish_non_exhaustive()
    }
}

impl SystemCache {
    /// Create an empty cache for `schema`.
    pub async fn new(cache_name: &'static str, schema: &'static TableSchema) -> Result<Self, CacheError> {
        let store = SqliteExecutor::open_in_memory()?;
        for statement in schema.create_statements() {
            store.execute_query(&Query::new(statement)).await?;
        }
        Ok(Self {
            cache_name,
            schema,
            store,
        })
    }

    #[must_use]
    pub const fn cache_name(&self) -> &'static str {
        self.cache_name
    }

    #[must_use]
    pub const fn schema(&self) -> &'static TableSchema {
        self.schema
    }

    /// Insert or replace `row`. Columns outside the schema are ignored,
    /// missing ones become `NULL`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::MissingKey`] if the primary key is absent.
    pub async fn add_item(&self, row: &Row) -> Result<(), CacheError> {
        if row.get(self.schema.primary_key).is_none_or(Value::is_null) {
            return Err(CacheError::MissingKey(self.cache_name.to_owned()));
        }
        let params = self
            .schema
            .column_names()
            .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
            .collect();
        self.store
            .execute_query(&Query::with_params(self.schema.upsert_sql(), params))
            .await?;
        Ok(())
    }

    /// Delete the row with primary key `key`. Returns whether it existed.
    pub async fn remove_item(&self, key: &str) -> Result<bool, CacheError> {
        let sql = format!(
            "DELETE FROM \"{table}\" WHERE \"{pk}\" = ? RETURNING \"{pk}\"",
            table = self.schema.table_name,
            pk = self.schema.primary_key,
        );
        let removed = self
            .store
            .execute_query(&Query::with_params(sql, vec![json!(key)]))
            .await?;
        Ok(!removed.is_empty())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Row>, CacheError> {
        Ok(self
            .find_by(self.schema.primary_key, &json!(key))
            .await?
            .into_iter()
            .next())
    }

    /// Every row, ordered by primary key.
    pub async fn get_all(&self) -> Result<Vec<Row>, CacheError> {
        let sql = format!(
            "SELECT * FROM \"{table}\" ORDER BY \"{pk}\"",
            table = self.schema.table_name,
            pk = self.schema.primary_key,
        );
        self.query(Query::new(sql)).await
    }

    /// Rows whose `column` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownColumn`] if `column` is not in the schema.
    pub async fn find_by(&self, column: &str, value: &Value) -> Result<Vec<Row>, CacheError> {
        if !self.schema.has_column(column) {
            return Err(CacheError::UnknownColumn(column.to_owned()));
        }
        let sql = format!(
            "SELECT * FROM \"{table}\" WHERE \"{column}\" = ? ORDER BY \"{pk}\"",
            table = self.schema.table_name,
            pk = self.schema.primary_key,
        );
        self.query(Query::with_params(sql, vec![value.clone()])).await
    }

    /// Run an arbitrary query against the cache's store.
    pub async fn query(&self, query: Query) -> Result<Vec<Row>, CacheError> {
        Ok(self.store.execute_query(&query).await?)
    }

    pub async fn insert_initial_data(&self, rows: &[Row]) -> Result<(), CacheError> {
        try_join_all(rows.iter().map(|row| self.add_item(row))).await?;
        Ok(())
    }

    /// All rows as a JSON array.
    pub async fn serialize(&self) -> Result<String, CacheError> {
        Ok(serde_json::to_string(&self.get_all().await?)?)
    }

    /// Upsert every row of a [`serialize`](Self::serialize)d array.
    pub async fn load_serialized(&self, serialized: &str) -> Result<(), CacheError> {
        let rows: Vec<Row> = serde_json::from_str(serialized)?;
        self.insert_initial_data(&rows).await
    }
}

/// Errors returned by the system caches.
#[derive(Debug)]
pub enum CacheError {
    /// No cache with this name.
    UnknownCache(String),
    /// No system table with this name.
    UnknownTable(String),
    /// The column is not part of the table.
    UnknownColumn(String),
    /// A row for this cache lacks its primary key.
    MissingKey(String),
    /// The value does not serialize to a JSON object.
    NotARow(String),
    Store(ExecutorError),
    Codec(serde_json::Error),
    Messaging(Box<MessagingError>),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCache(name) => write!(f, "unknown cache: {name}"),
            Self::UnknownTable(name) => write!(f, "unknown system table: {name}"),
            Self::UnknownColumn(name) => write!(f, "unknown column: {name}"),
            Self::MissingKey(cache) => write!(f, "row for {cache} has no primary key"),
            Self::NotARow(value) => write!(f, "not a row: {value}"),
            Self::Store(e) => write!(f, "cache store error: {e}"),
            Self::Codec(e) => write!(f, "cache codec error: {e}"),
            Self::Messaging(e) => write!(f, "messaging error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Messaging(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<ExecutorError> for CacheError {
    fn from(e: ExecutorError) -> Self {
        Self::Store(e)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

impl From<MessagingError> for CacheError {
    fn from(e: MessagingError) -> Self {
        Self::Messaging(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schema::{NODES, NODES_CACHE};

    fn node(id: &str, zone: &str) -> Row {
        to_row(&json!({
            "id": id,
            "externalAddress": format!("mem://{id}"),
            "latencyZone": zone,
            "freeMem": 1.5,
            "freeCpu": 0.25,
        }))
        .expect("row")
    }

    #[tokio::test]
    async fn test_add_get_and_replace() {
        let cache = SystemCache::new(NODES_CACHE, &NODES).await.expect("cache");
        cache.add_item(&node("n1", "z1")).await.expect("add");
        cache.add_item(&node("n1", "z2")).await.expect("replace");

        let row = cache.get("n1").await.expect("get").expect("present");
        assert_eq!(row["latencyZone"], json!("z2"));
        assert_eq!(row["freeMem"], json!(1.5));
        assert_eq!(cache.get_all().await.expect("all").len(), 1);
        assert!(cache.get("n2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_remove_and_find_by() {
        let cache = SystemCache::new(NODES_CACHE, &NODES).await.expect("cache");
        cache
            .insert_initial_data(&[node("a", "z1"), node("b", "z1"), node("c", "z2")])
            .await
            .expect("insert");

        let in_z1 = cache.find_by("latencyZone", &json!("z1")).await.expect("find");
        let ids: Vec<&Value> = in_z1.iter().map(|row| &row["id"]).collect();
        assert_eq!(ids, [&json!("a"), &json!("b")]);

        assert!(cache.remove_item("a").await.expect("remove"));
        assert!(!cache.remove_item("a").await.expect("remove"));
        assert!(matches!(
            cache.find_by("id; DROP TABLE nodes", &json!("x")).await,
            Err(CacheError::UnknownColumn(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let cache = SystemCache::new(NODES_CACHE, &NODES).await.expect("cache");
        let mut row = node("a", "z1");
        row.remove("id");
        assert!(matches!(cache.add_item(&row).await, Err(CacheError::MissingKey(_))));
    }

    #[tokio::test]
    async fn test_serialize_into_another_cache() {
        let source = SystemCache::new(NODES_CACHE, &NODES).await.expect("cache");
        source
            .insert_initial_data(&[node("a", "z1"), node("b", "z2")])
            .await
            .expect("insert");
        let serialized = source.serialize().await.expect("serialize");

        let copy = SystemCache::new(NODES_CACHE, &NODES).await.expect("cache");
        copy.load_serialized(&serialized).await.expect("load");
        assert_eq!(
            copy.get_all().await.expect("all"),
            source.get_all().await.expect("all")
        );
    }
}
