use crate::node::NodeRegistry;
use common::{DirectionalBytes, StatRecord, split};
use std::collections::HashMap;
use tracing::debug;

/// Traffic charged to one user over a whole cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserUsage {
    pub user_id: i64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct Aggregate {
    /// Coefficient-applied bytes per user, summed over all nodes.
    pub user_totals: HashMap<i64, u64>,
    /// Pre-coefficient bytes per node.
    pub node_totals: HashMap<i64, DirectionalBytes>,
    /// Coefficient-applied bytes per node and user.
    pub node_user_usages: HashMap<i64, HashMap<i64, u64>>,
}

impl Aggregate {
    pub fn is_empty(&self) -> bool {
        self.user_totals.is_empty()
    }

    /// Non-zero user totals sorted by user id.
    pub fn user_usages(&self) -> Vec<UserUsage> {
        let mut usages: Vec<UserUsage> = self
            .user_totals
            .iter()
            .filter(|(_, bytes)| **bytes > 0)
            .map(|(user_id, bytes)| UserUsage {
                user_id: *user_id,
                bytes: *bytes,
            })
            .collect();
        usages.sort_unstable_by_key(|usage| usage.user_id);
        usages
    }
}

/// Scales `bytes` by a node coefficient, truncating towards zero.
/// Negative and NaN coefficients charge nothing.
pub fn apply_coefficient(bytes: u64, coefficient: f64) -> u64 {
    if coefficient.is_nan() || coefficient <= 0.0 {
        return 0;
    }
    (bytes as f64 * coefficient) as u64
}

/// Folds polled records into per-user and per-node totals. Nodes that left
/// the registry since polling are skipped.
pub fn aggregate(polled: &HashMap<i64, Vec<StatRecord>>, registry: &NodeRegistry) -> Aggregate {
    let mut result = Aggregate::default();

    for (node_id, records) in polled {
        let Some(node) = registry.get(*node_id) else {
            debug!("Node {} is no longer registered, dropping its records", node_id);
            continue;
        };
        let coefficient = node.usage_coefficient();
        let method = node.traffic_calculation_method();

        let mut node_total = DirectionalBytes::default();
        for record in records {
            let counted = split(record, method);
            node_total += counted;

            let charged = apply_coefficient(counted.total(), coefficient);
            let user_total = result.user_totals.entry(record.user_id()).or_default();
            *user_total = user_total.saturating_add(charged);

            let node_user = result
                .node_user_usages
                .entry(*node_id)
                .or_default()
                .entry(record.user_id())
                .or_default();
            *node_user = node_user.saturating_add(charged);
        }
        result.node_totals.insert(*node_id, node_total);
    }

    result
}
