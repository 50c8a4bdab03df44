use crate::node::UsageNode;
use common::StatRecord;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a node contributed nothing to a cycle.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Fetch(#[from] crate::error::RecorderError),
}

/// Result of polling the whole fleet once.
#[derive(Debug, Default)]
pub struct PollResult {
    /// Non-empty records per node; every polled node has an entry.
    pub records: HashMap<i64, Vec<StatRecord>>,
    pub failed_nodes: Vec<i64>,
}

/// Fetches one node's stats, bounded by `limit`.
pub async fn poll_node(
    node: &dyn UsageNode,
    limit: Duration,
) -> std::result::Result<Vec<StatRecord>, PollError> {
    let records = timeout(limit, node.fetch_users_stats())
        .await
        .map_err(|_| PollError::Timeout(limit))??;

    Ok(records
        .into_iter()
        .filter(|record| !record.is_empty())
        .collect())
}

/// Polls every node concurrently. A failing node maps to an empty list and
/// never affects the others.
pub async fn poll_nodes(nodes: Vec<Arc<dyn UsageNode>>, limit: Duration) -> PollResult {
    let outcomes = join_all(nodes.into_iter().map(|node| async move {
        let outcome = poll_node(node.as_ref(), limit).await;
        (node.id(), outcome)
    }))
    .await;

    let mut result = PollResult::default();
    for (node_id, outcome) in outcomes {
        match outcome {
            Ok(records) => {
                debug!("Node {} reported {} usage records", node_id, records.len());
                result.records.insert(node_id, records);
            }
            Err(e) => {
                warn!("Failed to fetch users stats from node {}: {}", node_id, e);
                result.records.insert(node_id, Vec::new());
                result.failed_nodes.push(node_id);
            }
        }
    }
    result.failed_nodes.sort_unstable();
    result
}
