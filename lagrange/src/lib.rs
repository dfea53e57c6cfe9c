// Life of a node:
// 1. Open the message group and the messaging layer on a transport
// 2. Join an existing node (copy its system caches) or create the system tables
// 3. Register itself, then pick peers for its message group
// 4. Serve:
//     - UPDATE_TABLE: apply to the local caches, fan out as CACHE_SYNC
//     - PARTITION_*: query partitions and manage their live queries
//     - Housekeeping: resend or drop unacknowledged messages
//
// System components:
//  - Partition index (encoders, B+Tree, unified partition list)
//  - Replicated groups over SQLite or rqlite
//  - Reliable messaging with persisted, resent commands
//  - System caches and partition layers

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod config;
pub mod grammar;
pub mod messaging;
pub mod node;
pub mod partition;
pub mod partition_layer;
pub mod replication;
pub mod time;

mod e2e_tests;

pub use node::{Node, NodeError, NodeOptions};
