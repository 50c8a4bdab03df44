use crate::aggregator::UserUsage;
use crate::entity::{node_usage, node_user_usage, user};
use crate::error::Result;
use chrono::NaiveDateTime;
use common::DirectionalBytes;
use sea_orm::sea_query::{CaseStatement, Expr, SimpleExpr};
use sea_orm::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// Rows per bulk statement, keeps bound parameters well under SQLite's limit.
const BATCH_SIZE: usize = 250;

/// Durable, additive writer for the hourly usage ledgers and user counters.
pub struct UsageLedger {
    db: DatabaseConnection,
}

impl UsageLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Adds a node's traffic to its row for `bucket`, creating the row first if needed.
    #[instrument(skip(self))]
    pub async fn record_node_stats(
        &self,
        node_id: i64,
        traffic: DirectionalBytes,
        bucket: NaiveDateTime,
    ) -> Result<()> {
        if traffic.is_zero() {
            return Ok(());
        }

        let txn = self.db.begin().await?;

        let existing = node_usage::Entity::find()
            .filter(node_usage::Column::NodeId.eq(node_id))
            .filter(node_usage::Column::CreatedAt.eq(bucket))
            .one(&txn)
            .await?;
        if existing.is_none() {
            node_usage::ActiveModel {
                node_id: Set(node_id),
                created_at: Set(bucket),
                uplink: Set(0),
                downlink: Set(0),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }

        node_usage::Entity::update_many()
            .col_expr(
                node_usage::Column::Uplink,
                Expr::col(node_usage::Column::Uplink).add(to_db(traffic.uplink)),
            )
            .col_expr(
                node_usage::Column::Downlink,
                Expr::col(node_usage::Column::Downlink).add(to_db(traffic.downlink)),
            )
            .filter(node_usage::Column::NodeId.eq(node_id))
            .filter(node_usage::Column::CreatedAt.eq(bucket))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Adds per-user traffic to a node's hourly user rows. Missing rows are
    /// inserted in bulk, then every row is bumped with one CASE update per batch.
    #[instrument(skip(self, usages), fields(users = usages.len()))]
    pub async fn record_user_usage_logs(
        &self,
        node_id: i64,
        usages: &HashMap<i64, u64>,
        bucket: NaiveDateTime,
    ) -> Result<()> {
        let deltas = non_zero_deltas(usages.iter().map(|(id, bytes)| (*id, *bytes)));
        if deltas.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin().await?;

        let existing: HashSet<i64> = node_user_usage::Entity::find()
            .select_only()
            .column(node_user_usage::Column::UserId)
            .filter(node_user_usage::Column::NodeId.eq(node_id))
            .filter(node_user_usage::Column::CreatedAt.eq(bucket))
            .into_tuple::<i64>()
            .all(&txn)
            .await?
            .into_iter()
            .collect();

        let missing: Vec<i64> = deltas
            .iter()
            .map(|(user_id, _)| *user_id)
            .filter(|user_id| !existing.contains(user_id))
            .collect();
        for chunk in missing.chunks(BATCH_SIZE) {
            let rows = chunk.iter().map(|user_id| node_user_usage::ActiveModel {
                node_id: Set(node_id),
                user_id: Set(*user_id),
                created_at: Set(bucket),
                used_traffic: Set(0),
                ..Default::default()
            });
            node_user_usage::Entity::insert_many(rows)
                .exec_without_returning(&txn)
                .await?;
        }

        for chunk in deltas.chunks(BATCH_SIZE) {
            node_user_usage::Entity::update_many()
                .col_expr(
                    node_user_usage::Column::UsedTraffic,
                    Expr::col(node_user_usage::Column::UsedTraffic)
                        .add(delta_case(node_user_usage::Column::UserId, chunk)),
                )
                .filter(node_user_usage::Column::NodeId.eq(node_id))
                .filter(node_user_usage::Column::CreatedAt.eq(bucket))
                .filter(
                    node_user_usage::Column::UserId.is_in(chunk.iter().map(|(user_id, _)| *user_id)),
                )
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        debug!(
            "Recorded usage of {} users on node {} ({} new rows)",
            deltas.len(),
            node_id,
            missing.len()
        );
        Ok(())
    }

    /// Charges users: bumps current and lifetime counters and stamps `online_at`.
    /// Returns the number of user rows touched.
    #[instrument(skip(self, usages), fields(users = usages.len()))]
    pub async fn record_user_totals(&self, usages: &[UserUsage], now: NaiveDateTime) -> Result<u64> {
        let deltas = non_zero_deltas(usages.iter().map(|usage| (usage.user_id, usage.bytes)));
        if deltas.is_empty() {
            return Ok(0);
        }

        let txn = self.db.begin().await?;
        let mut updated = 0;
        for chunk in deltas.chunks(BATCH_SIZE) {
            let result = user::Entity::update_many()
                .col_expr(
                    user::Column::UsedTraffic,
                    Expr::col(user::Column::UsedTraffic).add(delta_case(user::Column::Id, chunk)),
                )
                .col_expr(
                    user::Column::LifetimeUsedTraffic,
                    Expr::col(user::Column::LifetimeUsedTraffic)
                        .add(delta_case(user::Column::Id, chunk)),
                )
                .col_expr(user::Column::OnlineAt, Expr::value(now))
                .filter(user::Column::Id.is_in(chunk.iter().map(|(user_id, _)| *user_id)))
                .exec(&txn)
                .await?;
            updated += result.rows_affected;
        }
        txn.commit().await?;

        Ok(updated)
    }
}

fn to_db(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn non_zero_deltas(usages: impl Iterator<Item = (i64, u64)>) -> Vec<(i64, i64)> {
    let mut deltas: Vec<(i64, i64)> = usages
        .filter(|(_, bytes)| *bytes > 0)
        .map(|(id, bytes)| (id, to_db(bytes)))
        .collect();
    deltas.sort_unstable();
    deltas
}

/// `CASE key WHEN id THEN delta ... ELSE 0 END`
fn delta_case<C: ColumnTrait>(key: C, deltas: &[(i64, i64)]) -> SimpleExpr {
    deltas
        .iter()
        .fold(CaseStatement::new(), |case, (id, delta)| {
            case.case(key.eq(*id), *delta)
        })
        .finally(0i64)
        .into()
}
