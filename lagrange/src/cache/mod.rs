//! Node-local caches of the replicated system tables.

pub mod context;
pub mod nodes;
pub mod partitions;
pub mod raft_groups;
pub mod schema;
pub mod system_cache;
pub mod tables;

pub use context::{NodeContext, TableUpdate};
pub use nodes::{NodeRecord, NodesCache};
pub use partitions::{PartitionGroupRecord, PartitionGroupsCache};
pub use raft_groups::{MESSAGES_GROUP_TYPE, PARTITION_GROUP_TYPE, RaftGroupRecord, RaftGroupsCache};
pub use system_cache::{CacheError, SystemCache};
pub use tables::{TableRecord, TablesCache};
