//! Replicated groups over an abstract consensus executor.

pub mod executor;
pub mod group;
pub mod message_group;
pub mod rqlite;
pub mod sqlite;

pub use executor::{ExecutorError, ExecutorFactory, LEADER_MARKER, Query, ReplicatedExecutor, Row};
pub use group::{GroupError, HouseKeeping, ReplicatedGroup};
pub use message_group::{HouseKeepingCallback, MessageGroup, PersistedMessage};
pub use rqlite::{RqliteExecutor, RqliteExecutorFactory};
pub use sqlite::{SqliteExecutor, SqliteExecutorFactory};
