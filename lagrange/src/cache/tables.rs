//! The `tables` table: one row per table, system tables included.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::schema::{TABLES, TABLES_CACHE};
use crate::cache::system_cache::{CacheError, SystemCache, from_row, to_row};

/// A row of the `tables` table. Timestamps are milliseconds since the epoch,
/// stored as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRecord {
    pub id: String,
    pub name: String,
    pub schema: Option<String>,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug)]
pub struct TablesCache {
    cache: SystemCache,
}

impl TablesCache {
    pub async fn new() -> Result<Self, CacheError> {
        Ok(Self {
            cache: SystemCache::new(TABLES_CACHE, &TABLES).await?,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &SystemCache {
        &self.cache
    }

    pub async fn add_table(&self, table: &TableRecord) -> Result<(), CacheError> {
        self.cache.add_item(&to_row(table)?).await
    }

    pub async fn get_table_by_id(&self, id: &str) -> Result<Option<TableRecord>, CacheError> {
        self.cache.get(id).await?.map(from_row).transpose()
    }

    pub async fn get_table_by_name(&self, name: &str) -> Result<Option<TableRecord>, CacheError> {
        self.cache
            .find_by("name", &json!(name))
            .await?
            .into_iter()
            .next()
            .map(from_row)
            .transpose()
    }

    pub async fn table_id_by_name(&self, name: &str) -> Result<Option<String>, CacheError> {
        Ok(self.get_table_by_name(name).await?.map(|table| table.id))
    }
}
