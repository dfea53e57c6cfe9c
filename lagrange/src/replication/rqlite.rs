//! Executor backed by an rqlite cluster over HTTP.
//!
//! Statements go to `POST /db/request?associative` as parameterized
//! statements (`[[sql, param, …]]`), so reads and writes share one path and
//! rows come back as column-keyed objects. Leadership is read from
//! `GET /readyz`, which reports `[+]leader ok` on a node that can serve
//! consensus traffic.
//!
//! Cluster membership is fixed when rqlite is launched (`-join`), so
//! [`add_member`](ReplicatedExecutor::add_member) only records the request.
//!
//! Every group of a node shares one rqlite database. A scoped executor
//! rewrites table and index names to `{group}__{name}` before sending, so
//! each group sees only its own `messages`, `live_query_subscribers` and
//! data tables. Schema-qualified names (`main.t`) are left alone.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::replication::executor::{
    ExecutorError, ExecutorFactory, Query, ReplicatedExecutor, Row,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for one rqlite node.
#[derive(Debug)]
pub struct RqliteExecutor {
    client: reqwest::Client,
    base_url: String,
    /// Prepended to every table and index name. Empty for an unscoped
    /// executor.
    table_prefix: String,
    closed: AtomicBool,
}

impl RqliteExecutor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            table_prefix: String::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Keep this executor's tables apart from other groups in the same
    /// database.
    #[must_use]
    pub fn scoped_to(mut self, group_id: &str) -> Self {
        let group: String = group_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.table_prefix = format!("{group}__");
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    /// `sql` as sent to rqlite.
    pub fn scoped_sql(&self, sql: &str) -> Result<String, ExecutorError> {
        if self.table_prefix.is_empty() {
            return Ok(sql.to_owned());
        }
        scope_tables(sql, &self.table_prefix)
    }

    fn ensure_open(&self) -> Result<(), ExecutorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecutorError::Closed);
        }
        Ok(())
    }
}

fn is_keyword(word: &sqlparser::tokenizer::Word, keywords: &[Keyword]) -> bool {
    word.quote_style.is_none() && keywords.contains(&word.keyword)
}

/// Rewrite the name following `FROM`, `INTO`, `UPDATE`, `JOIN`, `TABLE`
/// and `INDEX` (and `ON` in `CREATE INDEX`) to `"{prefix}{name}"`.
fn scope_tables(sql: &str, prefix: &str) -> Result<String, ExecutorError> {
    let tokens = Tokenizer::new(&SQLiteDialect {}, sql)
        .tokenize()
        .map_err(|e| ExecutorError::MalformedQuery(e.to_string()))?;

    let mut words = tokens.iter().filter_map(|token| match token {
        Token::Word(word) => Some(word),
        _ => None,
    });
    let creates_index = words.next().is_some_and(|w| is_keyword(w, &[Keyword::CREATE]))
        && words
            .next()
            .is_some_and(|w| is_keyword(w, &[Keyword::INDEX, Keyword::UNIQUE]));

    let mut scoped = String::with_capacity(sql.len() + 4 * prefix.len());
    let mut expect_name = false;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Whitespace(_) => {}
            Token::Word(word) if expect_name => {
                if is_keyword(word, &[Keyword::IF, Keyword::NOT, Keyword::EXISTS]) {
                    // IF NOT EXISTS
                } else {
                    expect_name = false;
                    let qualified = matches!(
                        tokens[i + 1..].iter().find(|t| !matches!(t, Token::Whitespace(_))),
                        Some(Token::Period)
                    );
                    if !qualified && !is_keyword(word, &[Keyword::SET]) {
                        let _ = write!(scoped, "\"{prefix}{}\"", word.value.replace('"', "\"\""));
                        continue;
                    }
                }
            }
            Token::Word(word) => {
                expect_name = is_keyword(
                    word,
                    &[
                        Keyword::FROM,
                        Keyword::INTO,
                        Keyword::UPDATE,
                        Keyword::JOIN,
                        Keyword::TABLE,
                        Keyword::INDEX,
                    ],
                ) || (creates_index && is_keyword(word, &[Keyword::ON]));
            }
            _ => expect_name = false,
        }
        let _ = write!(scoped, "{token}");
    }
    Ok(scoped)
}

/// Body for `/db/request`: one statement with its parameters inlined after
/// the SQL.
fn request_body(sql: String, query: &Query) -> Value {
    let mut statement = Vec::with_capacity(query.params.len() + 1);
    statement.push(Value::String(sql));
    statement.extend(query.params.iter().cloned());
    json!([statement])
}

/// Rows of the first result in an associative `/db/request` response.
fn parse_response(body: &Value) -> Result<Vec<Row>, ExecutorError> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        return Err(ExecutorError::Rejected(error.to_owned()));
    }
    let result = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|results| results.first())
        .ok_or_else(|| ExecutorError::Rejected("response has no results".to_owned()))?;

    if let Some(error) = result.get("error").and_then(Value::as_str) {
        return Err(ExecutorError::Rejected(error.to_owned()));
    }

    Ok(result
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.as_object().cloned())
                .collect()
        })
        .unwrap_or_default())
}

#[async_trait]
impl ReplicatedExecutor for RqliteExecutor {
    async fn execute_query(&self, query: &Query) -> Result<Vec<Row>, ExecutorError> {
        query.validate()?;
        self.ensure_open()?;
        let sql = self.scoped_sql(&query.sql)?;

        let body: Value = self
            .client
            .post(format!("{}/db/request?associative", self.base_url))
            .json(&request_body(sql, query))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_response(&body)
    }

    async fn status(&self) -> Result<String, ExecutorError> {
        self.ensure_open()?;
        // /readyz answers 503 when there is no leader; the body still says why.
        let response = self
            .client
            .get(format!("{}/readyz", self.base_url))
            .send()
            .await?;
        Ok(response.text().await?)
    }

    async fn add_member(&self, address: &str) -> Result<(), ExecutorError> {
        tracing::info!(
            address,
            cluster = %self.base_url,
            "rqlite membership is managed by the cluster; not adding member"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), ExecutorError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Points every group at the same rqlite node, each scoped to its own
/// tables.
#[derive(Debug, Clone)]
pub struct RqliteExecutorFactory {
    base_url: String,
}

impl RqliteExecutorFactory {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ExecutorFactory for RqliteExecutorFactory {
    async fn create(&self, group_id: &str) -> Result<Arc<dyn ReplicatedExecutor>, ExecutorError> {
        tracing::debug!(group_id, url = %self.base_url, "connecting group to rqlite");
        Ok(Arc::new(RqliteExecutor::new(self.base_url.clone())?.scoped_to(group_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schema::{LIVE_QUERY_SUBSCRIBERS, NODES};
    use crate::config::MessagingConfig;
    use crate::messaging::envelope::{Message, PING_NODE};
    use crate::replication::group::ReplicatedGroup;
    use crate::replication::message_group::MessageGroup;
    use crate::replication::sqlite::SqliteExecutor;
    use crate::time::ManualTimeSource;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal rqlite stand-in: `/db/request` runs the statement on one
    /// shared SQLite database, `/readyz` always reports a leader.
    async fn serve_rqlite() -> (String, Arc<SqliteExecutor>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let database = Arc::new(SqliteExecutor::open_in_memory().expect("open"));
        let shared = Arc::clone(&database);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&shared)));
            }
        });
        (url, database)
    }

    async fn serve_connection(stream: TcpStream, database: Arc<SqliteExecutor>) {
        let mut reader = BufReader::new(stream);
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
                return;
            }
            let mut content_length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).await.expect("header");
                let header = header.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':')
                    && name.eq_ignore_ascii_case("content-length")
                {
                    content_length = value.trim().parse().expect("length");
                }
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).await.expect("body");

            let response = if request_line.starts_with("GET /readyz") {
                "[+]node ok\n[+]leader ok".to_owned()
            } else {
                let statements: Vec<Vec<Value>> = serde_json::from_slice(&body).expect("statements");
                let mut statement = statements.into_iter().next().expect("statement");
                let sql = statement.remove(0);
                let query = Query::with_params(sql.as_str().expect("sql"), statement);
                match database.execute_query(&query).await {
                    Ok(rows) => json!({"results": [{"rows": rows}]}),
                    Err(e) => json!({"results": [{"error": e.to_string()}]}),
                }
                .to_string()
            };
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{response}",
                response.len()
            );
            reader.get_mut().write_all(reply.as_bytes()).await.expect("write");
        }
    }

    async fn message_group(factory: &RqliteExecutorFactory, group_id: &str) -> Arc<MessageGroup> {
        let executor = factory.create(group_id).await.expect("executor");
        let group = ReplicatedGroup::new(group_id, ["mem://a".to_owned()], executor).expect("group");
        let config = MessagingConfig {
            housekeeping_interval: Duration::from_secs(3600),
            ..MessagingConfig::default()
        };
        MessageGroup::open(group, &config, Arc::new(ManualTimeSource::new(1_000)))
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn test_groups_from_one_factory_keep_separate_logs() {
        let (url, database) = serve_rqlite().await;
        let factory = RqliteExecutorFactory::new(url);
        let first = message_group(&factory, "messages-a").await;
        let second = message_group(&factory, "messages-b").await;

        let message = Message::command(PING_NODE, json!({}), "mem://a");
        first
            .save_message(&message, "mem://c", &json!(null), None)
            .await
            .expect("save");

        assert_eq!(first.get_unacknowledged_messages().await.expect("scan").len(), 1);
        assert!(second.get_unacknowledged_messages().await.expect("scan").is_empty());
        assert!(
            !second
                .remove_message_by_message_id(&message.request_id.to_string())
                .await
                .expect("remove")
        );
        assert_eq!(first.get_unacknowledged_messages().await.expect("scan").len(), 1);

        let tables = database
            .execute_query(&Query::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            ))
            .await
            .expect("tables");
        let names: Vec<&str> = tables.iter().filter_map(|row| row["name"].as_str()).collect();
        assert_eq!(names, ["messages_a__messages", "messages_b__messages"]);
    }

    #[test]
    fn test_scoping_rewrites_table_and_index_names() {
        let executor = RqliteExecutor::new("http://127.0.0.1:4001")
            .expect("client")
            .scoped_to("p-1");
        assert_eq!(executor.table_prefix(), "p_1__");

        let statements = NODES.create_statements();
        assert_eq!(
            executor.scoped_sql(&statements[0]).expect("scope"),
            statements[0].replace("\"nodes\"", "\"p_1__nodes\"")
        );
        assert_eq!(
            executor
                .scoped_sql("CREATE INDEX IF NOT EXISTS \"idx_nodes_latencyZone\" ON \"nodes\" (\"latencyZone\")")
                .expect("scope"),
            "CREATE INDEX IF NOT EXISTS \"p_1__idx_nodes_latencyZone\" ON \"p_1__nodes\" (\"latencyZone\")"
        );
        assert_eq!(
            executor
                .scoped_sql("UPDATE messages SET resends = resends + 1 WHERE messageId = ?")
                .expect("scope"),
            "UPDATE \"p_1__messages\" SET resends = resends + 1 WHERE messageId = ?"
        );
        assert_eq!(
            executor
                .scoped_sql(&LIVE_QUERY_SUBSCRIBERS.upsert_sql())
                .expect("scope"),
            LIVE_QUERY_SUBSCRIBERS
                .upsert_sql()
                .replace("\"live_query_subscribers\"", "\"p_1__live_query_subscribers\"")
        );
        assert_eq!(
            executor
                .scoped_sql("SELECT n.id FROM nodes n JOIN main.t ON n.id = t.id WHERE x = 'FROM y'")
                .expect("scope"),
            "SELECT n.id FROM \"p_1__nodes\" n JOIN main.t ON n.id = t.id WHERE x = 'FROM y'"
        );

        let unscoped = RqliteExecutor::new("http://127.0.0.1:4001").expect("client");
        assert_eq!(unscoped.scoped_sql("SELECT * FROM nodes").expect("scope"), "SELECT * FROM nodes");
    }

    #[test]
    fn test_request_body_inlines_params() {
        let query = Query::with_params(
            "INSERT INTO t (a, b) VALUES (?, ?)",
            vec![json!("x"), json!(3)],
        );
        assert_eq!(
            request_body(query.sql.clone(), &query),
            json!([["INSERT INTO t (a, b) VALUES (?, ?)", "x", 3]])
        );
    }

    #[test]
    fn test_parse_rows() {
        let body = json!({
            "results": [{
                "types": {"id": "text", "n": "integer"},
                "rows": [{"id": "a", "n": 1}, {"id": "b", "n": 2}]
            }]
        });
        let rows = parse_response(&body).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], json!("b"));
    }

    #[test]
    fn test_parse_write_result_has_no_rows() {
        let body = json!({"results": [{"last_insert_id": 1, "rows_affected": 1}]});
        assert!(parse_response(&body).expect("rows").is_empty());
    }

    #[test]
    fn test_parse_errors() {
        let body = json!({"results": [{"error": "no such table: t"}]});
        assert!(matches!(
            parse_response(&body),
            Err(ExecutorError::Rejected(msg)) if msg == "no such table: t"
        ));
        assert!(matches!(
            parse_response(&json!({})),
            Err(ExecutorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_executor_short_circuits() {
        let executor = RqliteExecutor::new("http://127.0.0.1:4001/").expect("client");
        assert_eq!(executor.base_url(), "http://127.0.0.1:4001");
        executor.close().await.expect("close");
        assert!(matches!(
            executor.execute_query(&Query::new("SELECT 1")).await,
            Err(ExecutorError::Closed)
        ));
        assert!(matches!(executor.status().await, Err(ExecutorError::Closed)));
    }
}
