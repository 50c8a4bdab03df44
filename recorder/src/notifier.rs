use crate::aggregator::UserUsage;
use crate::entity::user;
use crate::error::Result;
use async_trait::async_trait;
use sea_orm::*;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument};

const LOOKUP_BATCH_SIZE: usize = 500;

/// Told about every cycle's charges before the user counters are bumped,
/// so stored usage is still the pre-cycle value.
#[async_trait]
pub trait UsageNotifier: Send + Sync {
    async fn usage_recorded(&self, db: &DatabaseConnection, usages: &[UserUsage]) -> Result<()>;
}

pub struct NoopNotifier;

#[async_trait]
impl UsageNotifier for NoopNotifier {
    async fn usage_recorded(&self, _db: &DatabaseConnection, _usages: &[UserUsage]) -> Result<()> {
        Ok(())
    }
}

/// A user went past a percentage of their data limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageAlert {
    pub user_id: i64,
    pub username: String,
    pub threshold: u8,
    pub used_traffic: i64,
    pub data_limit: i64,
}

pub struct ThresholdNotifier {
    thresholds: Vec<u8>,
    tx: Option<UnboundedSender<UsageAlert>>,
}

impl ThresholdNotifier {
    pub fn new(mut thresholds: Vec<u8>) -> Self {
        thresholds.retain(|t| *t > 0);
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            thresholds,
            tx: None,
        }
    }

    pub fn with_sender(mut self, tx: UnboundedSender<UsageAlert>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn thresholds(&self) -> &[u8] {
        &self.thresholds
    }

    /// Thresholds passed when usage moves from `before` to `after` against `limit`.
    pub fn crossed(&self, before: i64, after: i64, limit: i64) -> Vec<u8> {
        if limit <= 0 {
            return Vec::new();
        }
        let before = before as i128 * 100;
        let after = after as i128 * 100;
        self.thresholds
            .iter()
            .copied()
            .filter(|t| {
                let mark = *t as i128 * limit as i128;
                before < mark && mark <= after
            })
            .collect()
    }
}

#[async_trait]
impl UsageNotifier for ThresholdNotifier {
    #[instrument(skip(self, db, usages), fields(users = usages.len()))]
    async fn usage_recorded(&self, db: &DatabaseConnection, usages: &[UserUsage]) -> Result<()> {
        if self.thresholds.is_empty() || usages.is_empty() {
            return Ok(());
        }

        let deltas: HashMap<i64, u64> = usages.iter().map(|u| (u.user_id, u.bytes)).collect();
        let ids: Vec<i64> = deltas.keys().copied().collect();

        for chunk in ids.chunks(LOOKUP_BATCH_SIZE) {
            let users = user::Entity::find()
                .filter(user::Column::Id.is_in(chunk.iter().copied()))
                .filter(user::Column::DataLimit.is_not_null())
                .all(db)
                .await?;

            for user in users {
                let Some(limit) = user.data_limit else {
                    continue;
                };
                let delta = deltas.get(&user.id).copied().unwrap_or_default();
                let after = user
                    .used_traffic
                    .saturating_add(i64::try_from(delta).unwrap_or(i64::MAX));

                for threshold in self.crossed(user.used_traffic, after, limit) {
                    debug!(
                        "User {} ({}) reached {}% of data limit: {} / {}",
                        user.username, user.id, threshold, after, limit
                    );
                    if let Some(tx) = &self.tx {
                        let _ = tx.send(UsageAlert {
                            user_id: user.id,
                            username: user.username.clone(),
                            threshold,
                            used_traffic: after,
                            data_limit: limit,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
