//! Table descriptors for every persisted table.
//!
//! Each table is described once here. Create statements and upserts are
//! generated from the descriptor so column lists never drift between the
//! DDL and the queries that write rows.

use std::fmt::Write;

/// A single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
}

const fn column(name: &'static str, sql_type: &'static str) -> Column {
    Column { name, sql_type }
}

/// A table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: &'static str,
    pub columns: &'static [Column],
    pub primary_key: &'static str,
    /// Columns with a secondary index.
    pub indexes: &'static [&'static str],
}

impl TableSchema {
    /// `CREATE TABLE` followed by one `CREATE INDEX` per indexed column.
    /// Every statement is idempotent.
    #[must_use]
    pub fn create_statements(&self) -> Vec<String> {
        let columns = self
            .columns
            .iter()
            .map(|c| {
                if c.name == self.primary_key {
                    format!("\"{}\" {} PRIMARY KEY", c.name, c.sql_type)
                } else {
                    format!("\"{}\" {}", c.name, c.sql_type)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({columns})",
            self.table_name
        )];
        for index in self.indexes {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{table}_{index}\" ON \"{table}\" (\"{index}\")",
                table = self.table_name
            ));
        }
        statements
    }

    /// Upsert keyed on the primary key, binding every column in declaration
    /// order.
    #[must_use]
    pub fn upsert_sql(&self) -> String {
        let mut names = String::new();
        let mut placeholders = String::new();
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                names.push_str(", ");
                placeholders.push_str(", ");
            }
            let _ = write!(names, "\"{}\"", c.name);
            placeholders.push('?');
        }
        format!(
            "INSERT OR REPLACE INTO \"{}\" ({names}) VALUES ({placeholders})",
            self.table_name
        )
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|c| c.name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

pub const NODES: TableSchema = TableSchema {
    table_name: "nodes",
    columns: &[
        column("id", "TEXT"),
        column("externalAddress", "TEXT"),
        column("latencyZone", "TEXT"),
        column("freeMem", "REAL"),
        column("freeCpu", "REAL"),
    ],
    primary_key: "id",
    indexes: &["latencyZone"],
};

pub const RAFT_GROUPS: TableSchema = TableSchema {
    table_name: "raftgroups",
    columns: &[
        column("id", "TEXT"),
        column("type", "TEXT"),
        column("members", "TEXT"),
    ],
    primary_key: "id",
    indexes: &["type"],
};

pub const CODE: TableSchema = TableSchema {
    table_name: "code",
    columns: &[
        column("id", "TEXT"),
        column("name", "TEXT"),
        column("type", "TEXT"),
        column("body", "TEXT"),
    ],
    primary_key: "id",
    indexes: &["name", "type"],
};

pub const TABLES: TableSchema = TableSchema {
    table_name: "tables",
    columns: &[
        column("id", "TEXT"),
        column("name", "TEXT"),
        column("schema", "TEXT"),
        column("createdAt", "TEXT"),
        column("modifiedAt", "TEXT"),
        column("createdBy", "TEXT"),
    ],
    primary_key: "id",
    indexes: &["name"],
};

pub const PARTITION_GROUPS: TableSchema = TableSchema {
    table_name: "partitiongroup",
    columns: &[
        column("id", "TEXT"),
        column("tableId", "TEXT"),
        column("members", "TEXT"),
        column("parentPartition", "TEXT"),
        column("childPartitions", "TEXT"),
        column("spanStart", "TEXT"),
        column("spanEnd", "TEXT"),
    ],
    primary_key: "id",
    indexes: &["tableId", "parentPartition"],
};

pub const MESSAGES: TableSchema = TableSchema {
    table_name: "messages",
    columns: &[
        column("messageId", "TEXT"),
        column("messageName", "TEXT"),
        column("context", "TEXT"),
        column("callback", "TEXT"),
        column("creationTime", "INTEGER"),
        column("resends", "INTEGER"),
        column("destination", "TEXT"),
        column("payload", "TEXT"),
    ],
    primary_key: "messageId",
    indexes: &[],
};

pub const LIVE_QUERY_SUBSCRIBERS: TableSchema = TableSchema {
    table_name: "live_query_subscribers",
    columns: &[
        column("id", "TEXT"),
        column("columns", "TEXT"),
        column("recipients", "TEXT"),
    ],
    primary_key: "id",
    indexes: &[],
};

/// Cache names, as carried in `UPDATE_TABLE` messages.
pub const NODES_CACHE: &str = "NodesCache";
pub const RAFT_GROUPS_CACHE: &str = "RaftGroupsCache";
pub const CODE_CACHE: &str = "CodeCache";
pub const PARTITIONS_CACHE: &str = "PartitionsCache";
pub const TABLES_CACHE: &str = "TablesCache";

/// Every system cache with its table, in bootstrap order.
pub const SYSTEM_TABLES: [(&str, &TableSchema); 5] = [
    (TABLES_CACHE, &TABLES),
    (PARTITIONS_CACHE, &PARTITION_GROUPS),
    (RAFT_GROUPS_CACHE, &RAFT_GROUPS),
    (NODES_CACHE, &NODES),
    (CODE_CACHE, &CODE),
];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_statements() {
        let statements = CODE.create_statements();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[0],
            "CREATE TABLE IF NOT EXISTS \"code\" (\"id\" TEXT PRIMARY KEY, \"name\" TEXT, \"type\" TEXT, \"body\" TEXT)"
        );
        assert!(statements[2].contains("ON \"code\" (\"type\")"));
    }

    #[test]
    fn test_upsert_sql() {
        assert_eq!(
            RAFT_GROUPS.upsert_sql(),
            "INSERT OR REPLACE INTO \"raftgroups\" (\"id\", \"type\", \"members\") VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_all_tables_create_in_sqlite() {
        let connection = Connection::open_in_memory().expect("open");
        let tables = SYSTEM_TABLES
            .iter()
            .map(|(_, schema)| *schema)
            .chain([&MESSAGES, &LIVE_QUERY_SUBSCRIBERS]);
        for schema in tables {
            for statement in schema.create_statements() {
                connection.execute(&statement, []).expect("create");
            }
            // Idempotent.
            for statement in schema.create_statements() {
                connection.execute(&statement, []).expect("create again");
            }
            assert!(schema.has_column(schema.primary_key));
        }
    }
}
