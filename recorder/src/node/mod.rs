mod http_node;

pub use http_node::{HttpClient, HttpNode, http_client};

use crate::entity::node;
use crate::error::Result;
use async_trait::async_trait;
use common::{StatRecord, TrafficCalculationMethod};
use dashmap::DashMap;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A remote node whose traffic is accounted for.
#[async_trait]
pub trait UsageNode: Send + Sync {
    fn id(&self) -> i64;

    /// Multiplier applied to every byte charged to users on this node.
    fn usage_coefficient(&self) -> f64;

    fn traffic_calculation_method(&self) -> TrafficCalculationMethod;

    /// Per-user traffic deltas since the previous call.
    async fn fetch_users_stats(&self) -> Result<Vec<StatRecord>>;
}

/// Live node handles, shared between the scheduler and each recording cycle.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<i64, Arc<dyn UsageNode>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<dyn UsageNode>) {
        self.nodes.insert(node.id(), node);
    }

    pub fn remove(&self, node_id: i64) -> bool {
        self.nodes.remove(&node_id).is_some()
    }

    pub fn get(&self, node_id: i64) -> Option<Arc<dyn UsageNode>> {
        self.nodes.get(&node_id).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn UsageNode>> {
        self.nodes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Replaces the registered handles with one per stored node row.
    /// Rows whose handle cannot be built are left out.
    pub fn sync<F>(&self, rows: &[node::Model], build: F)
    where
        F: Fn(&node::Model) -> Result<Arc<dyn UsageNode>>,
    {
        let wanted: HashSet<i64> = rows.iter().map(|row| row.id).collect();
        self.nodes.retain(|id, _| wanted.contains(id));

        for row in rows {
            match build(row) {
                Ok(handle) => self.register(handle),
                Err(e) => {
                    warn!("Skipping node {} ({}): {}", row.id, row.name, e);
                    self.remove(row.id);
                }
            }
        }
        debug!("Node registry holds {} nodes", self.len());
    }
}

pub async fn load_nodes(db: &DatabaseConnection) -> Result<Vec<node::Model>> {
    let nodes = node::Entity::find()
        .order_by_asc(node::Column::Id)
        .all(db)
        .await?;
    Ok(nodes)
}
