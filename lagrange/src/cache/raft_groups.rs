//! The `raftgroups` table. Members are node ids, stored comma-separated.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::schema::{RAFT_GROUPS, RAFT_GROUPS_CACHE};
use crate::cache::system_cache::{CacheError, SystemCache, from_row, to_row};

/// Group holding a node's message log.
pub const MESSAGES_GROUP_TYPE: &str = "messages";
/// Group replicating one partition of a table.
pub const PARTITION_GROUP_TYPE: &str = "partition";

/// A row of the `raftgroups` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftGroupRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub members: String,
}

impl RaftGroupRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, group_type: &str, members: &[String]) -> Self {
        Self {
            id: id.into(),
            group_type: group_type.to_owned(),
            members: members.join(","),
        }
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        split_members(&self.members)
    }
}

pub(crate) fn split_members(members: &str) -> Vec<String> {
    members
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .collect()
}

#[derive(Debug)]
pub struct RaftGroupsCache {
    cache: SystemCache,
}

impl RaftGroupsCache {
    pub async fn new() -> Result<Self, CacheError> {
        Ok(Self {
            cache: SystemCache::new(RAFT_GROUPS_CACHE, &RAFT_GROUPS).await?,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &SystemCache {
        &self.cache
    }

    pub async fn add_raft_group(&self, group: &RaftGroupRecord) -> Result<(), CacheError> {
        self.cache.add_item(&to_row(group)?).await
    }

    pub async fn get_raft_group_by_id(&self, id: &str) -> Result<Option<RaftGroupRecord>, CacheError> {
        self.cache.get(id).await?.map(from_row).transpose()
    }

    pub async fn groups_of_type(&self, group_type: &str) -> Result<Vec<RaftGroupRecord>, CacheError> {
        self.cache
            .find_by("type", &json!(group_type))
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    /// Replace the members of group `id`. Returns the updated record, or
    /// `None` if the group is unknown.
    pub async fn set_members(&self, id: &str, members: &[String]) -> Result<Option<RaftGroupRecord>, CacheError> {
        let Some(mut group) = self.get_raft_group_by_id(id).await? else {
            return Ok(None);
        };
        group.members = members.join(",");
        self.add_raft_group(&group).await?;
        Ok(Some(group))
    }
}
