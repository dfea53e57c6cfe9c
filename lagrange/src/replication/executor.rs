//! Interface to the consensus-backed SQL engine.
//!
//! The coordination layer only ever talks to a [`ReplicatedExecutor`]. How
//! replication physically happens is the executor's business: the
//! [`SqliteExecutor`](super::sqlite::SqliteExecutor) is a single-node stand-in,
//! the [`RqliteExecutor`](super::rqlite::RqliteExecutor) drives a real
//! rqlite cluster.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// Substring of [`ReplicatedExecutor::status`] that marks the local member as
/// the group leader.
pub const LEADER_MARKER: &str = "leader ok";

/// A result row, column name to value.
pub type Row = serde_json::Map<String, Value>;

/// A parameterized SQL statement. Values are only ever bound, never spliced
/// into the SQL text.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Query {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Reject empty statements and placeholder/parameter count mismatches.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.sql.trim().is_empty() {
            return Err(ExecutorError::MalformedQuery("empty statement".to_owned()));
        }
        let placeholders = count_placeholders(&self.sql);
        if placeholders != self.params.len() {
            return Err(ExecutorError::MalformedQuery(format!(
                "statement has {placeholders} placeholders but {} parameters were bound",
                self.params.len()
            )));
        }
        Ok(())
    }
}

/// Count `?` placeholders outside quoted strings and identifiers.
fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (Some(open), c) if c == open => quote = None,
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

/// A replicated SQL engine.
#[async_trait]
pub trait ReplicatedExecutor: Send + Sync {
    /// Run one statement through consensus. Statements without a result set
    /// return no rows.
    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>, ExecutorError>;

    /// Health report of the local member. Contains [`LEADER_MARKER`] when
    /// this member currently leads the group.
    async fn status(&self) -> Result<String, ExecutorError>;

    /// Admit a peer into the group.
    async fn add_member(&self, address: &str) -> Result<(), ExecutorError>;

    async fn close(&self) -> Result<(), ExecutorError>;
}

/// Creates one executor per replicated group.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn create(&self, group_id: &str) -> Result<Arc<dyn ReplicatedExecutor>, ExecutorError>;
}

/// Errors returned by executors.
#[derive(Debug)]
pub enum ExecutorError {
    /// The statement was rejected before reaching the engine.
    MalformedQuery(String),
    /// The embedded SQLite engine failed.
    Sqlite(rusqlite::Error),
    /// The HTTP call to the consensus cluster failed.
    Http(reqwest::Error),
    /// The consensus cluster answered with an error.
    Rejected(String),
    /// The executor has been closed.
    Closed,
    /// An internal lock was poisoned.
    LockPoisoned,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedQuery(msg) => write!(f, "malformed query: {msg}"),
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::Http(e) => write!(f, "http error: {e}"),
            Self::Rejected(msg) => write!(f, "statement rejected: {msg}"),
            Self::Closed => write!(f, "executor is closed"),
            Self::LockPoisoned => write!(f, "executor lock poisoned"),
        }
    }
}

impl std::error::Error for ExecutorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders_inside_quotes_are_ignored() {
        assert_eq!(count_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"), 2);
        assert_eq!(count_placeholders("SELECT '?' FROM t WHERE a = ?"), 1);
        assert_eq!(count_placeholders("SELECT \"odd?col\" FROM t"), 0);
    }

    #[test]
    fn test_validate() {
        assert!(Query::with_params("SELECT ?", vec![json!(1)]).validate().is_ok());
        assert!(matches!(
            Query::new("   ").validate(),
            Err(ExecutorError::MalformedQuery(_))
        ));
        assert!(matches!(
            Query::with_params("SELECT ?, ?", vec![json!(1)]).validate(),
            Err(ExecutorError::MalformedQuery(_))
        ));
        assert!(matches!(
            Query::with_params("SELECT 1", vec![json!(1)]).validate(),
            Err(ExecutorError::MalformedQuery(_))
        ));
    }
}
