//! The `nodes` table: every node's address, latency zone and free resources.

use std::time::Duration;

use futures::future::join_all;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::schema::{NODES, NODES_CACHE};
use crate::cache::system_cache::{CacheError, SystemCache, from_row, to_row};
use crate::messaging::layer::MessagingLayer;
use crate::replication::executor::Query;

/// A row of the `nodes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub external_address: String,
    pub latency_zone: String,
    #[serde(default)]
    pub free_mem: f64,
    #[serde(default)]
    pub free_cpu: f64,
}

#[derive(Debug)]
pub struct NodesCache {
    cache: SystemCache,
}

impl NodesCache {
    pub async fn new() -> Result<Self, CacheError> {
        Ok(Self {
            cache: SystemCache::new(NODES_CACHE, &NODES).await?,
        })
    }

    #[must_use]
    pub const fn cache(&self) -> &SystemCache {
        &self.cache
    }

    pub async fn add_node(&self, node: &NodeRecord) -> Result<(), CacheError> {
        self.cache.add_item(&to_row(node)?).await
    }

    pub async fn get_node_by_id(&self, id: &str) -> Result<Option<NodeRecord>, CacheError> {
        self.cache.get(id).await?.map(from_row).transpose()
    }

    pub async fn get_node_by_address(&self, address: &str) -> Result<Option<NodeRecord>, CacheError> {
        self.find("externalAddress", address)
            .await
            .map(|nodes| nodes.into_iter().next())
    }

    pub async fn all_nodes(&self) -> Result<Vec<NodeRecord>, CacheError> {
        self.cache.get_all().await?.into_iter().map(from_row).collect()
    }

    pub async fn nodes_in_zone(&self, zone: &str) -> Result<Vec<NodeRecord>, CacheError> {
        self.find("latencyZone", zone).await
    }

    /// Distinct latency zones, sorted.
    pub async fn latency_zones(&self) -> Result<Vec<String>, CacheError> {
        let rows = self
            .cache
            .query(Query::new(
                "SELECT DISTINCT \"latencyZone\" FROM \"nodes\" \
                 WHERE \"latencyZone\" IS NOT NULL ORDER BY \"latencyZone\"",
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("latencyZone")?.as_str().map(str::to_owned))
            .collect())
    }

    pub async fn random_node_from_latency_zone(&self, zone: &str) -> Result<Option<NodeRecord>, CacheError> {
        let nodes = self.nodes_in_zone(zone).await?;
        Ok(nodes.choose(&mut rand::rng()).cloned())
    }

    /// Ping one random node of every zone and return the zone that answered
    /// fastest, with its round-trip time. Zones whose node does not answer
    /// are skipped; `None` means no zone answered.
    pub async fn closest_latency_zone(
        &self,
        layer: &MessagingLayer,
    ) -> Result<Option<(String, Duration)>, CacheError> {
        let mut probes = Vec::new();
        for zone in self.latency_zones().await? {
            if let Some(node) = self.random_node_from_latency_zone(&zone).await? {
                probes.push((zone, node.external_address));
            }
        }

        let pings = join_all(probes.iter().map(|(_, address)| layer.ping_node(address))).await;
        Ok(probes
            .into_iter()
            .zip(pings)
            .filter_map(|((zone, address), ping)| match ping {
                Ok(rtt) => Some((zone, rtt)),
                Err(e) => {
                    tracing::debug!(%zone, %address, "latency probe failed: {e}");
                    None
                }
            })
            .min_by_key(|(_, rtt)| *rtt))
    }

    async fn find(&self, column: &str, value: &str) -> Result<Vec<NodeRecord>, CacheError> {
        self.cache
            .find_by(column, &json!(value))
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, zone: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_owned(),
            external_address: format!("mem://{id}"),
            latency_zone: zone.to_owned(),
            free_mem: 2.0,
            free_cpu: 0.5,
        }
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_address() {
        let nodes = NodesCache::new().await.expect("cache");
        nodes.add_node(&node("a", "z1")).await.expect("add");

        assert_eq!(
            nodes.get_node_by_id("a").await.expect("get"),
            Some(node("a", "z1"))
        );
        assert_eq!(
            nodes
                .get_node_by_address("mem://a")
                .await
                .expect("get")
                .map(|n| n.id),
            Some("a".to_owned())
        );
        assert!(nodes.get_node_by_id("b").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_latency_zones() {
        let nodes = NodesCache::new().await.expect("cache");
        for (id, zone) in [("a", "z2"), ("b", "z1"), ("c", "z2")] {
            nodes.add_node(&node(id, zone)).await.expect("add");
        }

        assert_eq!(nodes.latency_zones().await.expect("zones"), ["z1", "z2"]);
        assert_eq!(nodes.nodes_in_zone("z2").await.expect("zone").len(), 2);

        let picked = nodes
            .random_node_from_latency_zone("z2")
            .await
            .expect("pick")
            .expect("present");
        assert_eq!(picked.latency_zone, "z2");
        assert!(
            nodes
                .random_node_from_latency_zone("z9")
                .await
                .expect("pick")
                .is_none()
        );
    }
}
