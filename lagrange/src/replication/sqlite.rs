//! Single-node executor over an embedded SQLite database.
//!
//! There is no consensus here. The executor reports itself as leader unless
//! told otherwise with [`SqliteExecutor::set_leader`], which tests use to
//! simulate followers.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::{Number, Value};

use crate::replication::executor::{
    ExecutorError, ExecutorFactory, LEADER_MARKER, Query, ReplicatedExecutor, Row,
};

/// Embedded SQLite executor.
#[derive(Debug)]
pub struct SqliteExecutor {
    connection: Mutex<Option<Connection>>,
    leader: AtomicBool,
    members: Mutex<BTreeSet<String>>,
}

impl SqliteExecutor {
    pub fn open_in_memory() -> Result<Self, ExecutorError> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    pub fn open(path: &Path) -> Result<Self, ExecutorError> {
        Ok(Self::with_connection(Connection::open(path)?))
    }

    fn with_connection(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(Some(connection)),
            leader: AtomicBool::new(true),
            members: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make [`status`](ReplicatedExecutor::status) report this member as
    /// leader or follower.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Peers admitted through [`add_member`](ReplicatedExecutor::add_member).
    pub fn members(&self) -> Result<Vec<String>, ExecutorError> {
        let members = self.members.lock().map_err(|_| ExecutorError::LockPoisoned)?;
        Ok(members.iter().cloned().collect())
    }

    fn run(connection: &Connection, query: &Query) -> Result<Vec<Row>, ExecutorError> {
        let params: Vec<SqlValue> = query.params.iter().map(to_sql_value).collect();
        let mut statement = connection.prepare(&query.sql)?;

        if statement.column_count() == 0 {
            statement.execute(rusqlite::params_from_iter(params))?;
            return Ok(Vec::new());
        }

        let columns: Vec<String> = statement
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let mut rows = statement.query(rusqlite::params_from_iter(params))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut result = Row::new();
            for (i, name) in columns.iter().enumerate() {
                let value: SqlValue = row.get(i)?;
                result.insert(name.clone(), from_sql_value(value));
            }
            results.push(result);
        }
        Ok(results)
    }
}

/// JSON parameter to SQLite value. Booleans become integers, arrays and
/// objects are stored as their JSON text.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n.as_i64().map_or_else(
            || SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            SqlValue::Integer,
        ),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Number(n.into()),
        SqlValue::Real(n) => Number::from_f64(n).map_or(Value::Null, Value::Number),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(bytes) => Value::Array(bytes.into_iter().map(Value::from).collect()),
    }
}

#[async_trait]
impl ReplicatedExecutor for SqliteExecutor {
    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>, ExecutorError> {
        query.validate()?;
        let guard = self
            .connection
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;
        let connection = guard.as_ref().ok_or(ExecutorError::Closed)?;
        Self::run(connection, query)
    }

    async fn status(&self) -> Result<String, ExecutorError> {
        let open = self
            .connection
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .is_some();
        if !open {
            return Err(ExecutorError::Closed);
        }
        if self.leader.load(Ordering::SeqCst) {
            Ok(format!("[+]node ok\n[+]{LEADER_MARKER}"))
        } else {
            Ok("[+]node ok\n[-]leader unavailable".to_owned())
        }
    }

    async fn add_member(&self, address: &str) -> Result<(), ExecutorError> {
        tracing::debug!(address, "sqlite executor recording member");
        self.members
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .insert(address.to_owned());
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?
            .take();
        if let Some(connection) = connection {
            connection.close().map_err(|(_, e)| ExecutorError::Sqlite(e))?;
        }
        Ok(())
    }
}

/// Hands out [`SqliteExecutor`]s, in memory or one file per group.
#[derive(Debug, Clone, Default)]
pub struct SqliteExecutorFactory {
    directory: Option<PathBuf>,
}

impl SqliteExecutorFactory {
    #[must_use]
    pub const fn in_memory() -> Self {
        Self { directory: None }
    }

    /// Store each group in `{directory}/{group_id}.db`.
    #[must_use]
    pub const fn in_directory(directory: PathBuf) -> Self {
        Self {
            directory: Some(directory),
        }
    }
}

#[async_trait]
impl ExecutorFactory for SqliteExecutorFactory {
    async fn create(&self, group_id: &str) -> Result<Arc<dyn ReplicatedExecutor>, ExecutorError> {
        let executor = match &self.directory {
            Some(directory) => SqliteExecutor::open(&directory.join(format!("{group_id}.db")))?,
            None => SqliteExecutor::open_in_memory()?,
        };
        Ok(Arc::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn executor_with_table() -> SqliteExecutor {
        let executor = SqliteExecutor::open_in_memory().expect("open");
        executor
            .execute_query(&Query::new(
                "CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER, r REAL, flag INTEGER, doc TEXT)",
            ))
            .await
            .expect("create");
        executor
    }

    #[tokio::test]
    async fn test_insert_and_select_with_params() {
        let executor = executor_with_table().await;
        let rows = executor
            .execute_query(&Query::with_params(
                "INSERT INTO t (id, n, r, flag, doc) VALUES (?, ?, ?, ?, ?)",
                vec![json!("a"), json!(7), json!(1.5), json!(true), json!({"x": [1, 2]})],
            ))
            .await
            .expect("insert");
        assert!(rows.is_empty());

        let rows = executor
            .execute_query(&Query::with_params(
                "SELECT * FROM t WHERE id = ?",
                vec![json!("a")],
            ))
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], json!(7));
        assert_eq!(rows[0]["r"], json!(1.5));
        assert_eq!(rows[0]["flag"], json!(1));
        assert_eq!(rows[0]["doc"], json!("{\"x\":[1,2]}"));
    }

    #[tokio::test]
    async fn test_delete_returning() {
        let executor = executor_with_table().await;
        executor
            .execute_query(&Query::with_params(
                "INSERT INTO t (id) VALUES (?)",
                vec![json!("gone")],
            ))
            .await
            .expect("insert");
        let removed = executor
            .execute_query(&Query::with_params(
                "DELETE FROM t WHERE id = ? RETURNING id",
                vec![json!("gone")],
            ))
            .await
            .expect("delete");
        assert_eq!(removed.len(), 1);
        let removed = executor
            .execute_query(&Query::with_params(
                "DELETE FROM t WHERE id = ? RETURNING id",
                vec![json!("gone")],
            ))
            .await
            .expect("delete");
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_query_never_reaches_sqlite() {
        let executor = executor_with_table().await;
        let result = executor
            .execute_query(&Query::with_params("SELECT * FROM t WHERE id = ?", vec![]))
            .await;
        assert!(matches!(result, Err(ExecutorError::MalformedQuery(_))));
    }

    #[tokio::test]
    async fn test_status_reflects_leadership() {
        let executor = SqliteExecutor::open_in_memory().expect("open");
        assert!(executor.status().await.expect("status").contains(LEADER_MARKER));
        executor.set_leader(false);
        assert!(!executor.status().await.expect("status").contains(LEADER_MARKER));
    }

    #[tokio::test]
    async fn test_closed_executor_rejects_queries() {
        let executor = SqliteExecutor::open_in_memory().expect("open");
        executor.close().await.expect("close");
        executor.close().await.expect("close twice");
        assert!(matches!(
            executor.execute_query(&Query::new("SELECT 1")).await,
            Err(ExecutorError::Closed)
        ));
        assert!(matches!(executor.status().await, Err(ExecutorError::Closed)));
    }

    #[tokio::test]
    async fn test_add_member_is_recorded() {
        let executor = SqliteExecutor::open_in_memory().expect("open");
        executor.add_member("mem://peer").await.expect("add");
        assert_eq!(executor.members().expect("members"), vec!["mem://peer"]);
    }

    #[tokio::test]
    async fn test_file_factory_persists_per_group() {
        let dir = tempdir().expect("create temp dir");
        let factory = SqliteExecutorFactory::in_directory(dir.path().to_path_buf());

        let executor = factory.create("group-1").await.expect("create");
        executor
            .execute_query(&Query::new("CREATE TABLE kv (k TEXT)"))
            .await
            .expect("create table");
        executor
            .execute_query(&Query::with_params("INSERT INTO kv VALUES (?)", vec![json!("v")]))
            .await
            .expect("insert");
        executor.close().await.expect("close");

        let reopened = factory.create("group-1").await.expect("reopen");
        let rows = reopened
            .execute_query(&Query::new("SELECT k FROM kv"))
            .await
            .expect("select");
        assert_eq!(rows.len(), 1);
        assert!(dir.path().join("group-1.db").exists());
    }
}
