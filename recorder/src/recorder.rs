use crate::aggregator::aggregate;
use crate::error::Result;
use crate::ledger::UsageLedger;
use crate::node::NodeRegistry;
use crate::notifier::UsageNotifier;
use crate::poller::{DEFAULT_NODE_TIMEOUT, poll_nodes};
use chrono::NaiveDateTime;
use common::{current_timestamp, hour_bucket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// What one recording cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub nodes_polled: usize,
    pub nodes_failed: usize,
    pub users_charged: usize,
    pub charged_bytes: u64,
}

/// Runs recording cycles: poll every node, aggregate, then persist.
/// Holds no state between cycles besides what the ledger stores.
pub struct UsageRecorder {
    registry: NodeRegistry,
    ledger: UsageLedger,
    notifier: Arc<dyn UsageNotifier>,
    node_timeout: Duration,
}

impl UsageRecorder {
    pub fn new(registry: NodeRegistry, ledger: UsageLedger, notifier: Arc<dyn UsageNotifier>) -> Self {
        Self {
            registry,
            ledger,
            notifier,
            node_timeout: DEFAULT_NODE_TIMEOUT,
        }
    }

    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub async fn record_user_usages(&self) -> Result<CycleReport> {
        self.record_user_usages_at(current_timestamp()).await
    }

    #[instrument(skip(self))]
    pub async fn record_user_usages_at(&self, now: NaiveDateTime) -> Result<CycleReport> {
        let bucket = hour_bucket(now);

        let polled = poll_nodes(self.registry.snapshot(), self.node_timeout).await;
        let mut report = CycleReport {
            nodes_polled: polled.records.len(),
            nodes_failed: polled.failed_nodes.len(),
            ..Default::default()
        };

        let aggregate = aggregate(&polled.records, &self.registry);
        if aggregate.is_empty() {
            debug!("No usage reported by {} nodes", report.nodes_polled);
            return Ok(report);
        }

        let mut node_totals: Vec<_> = aggregate.node_totals.iter().collect();
        node_totals.sort_unstable_by_key(|(node_id, _)| **node_id);
        for (node_id, traffic) in node_totals {
            self.ledger.record_node_stats(*node_id, *traffic, bucket).await?;
        }

        let usages = aggregate.user_usages();
        if !usages.is_empty() {
            self.notifier
                .usage_recorded(self.ledger.db(), &usages)
                .await?;
            self.ledger.record_user_totals(&usages, now).await?;
        }

        let mut node_user_usages: Vec<_> = aggregate.node_user_usages.iter().collect();
        node_user_usages.sort_unstable_by_key(|(node_id, _)| **node_id);
        for (node_id, user_usages) in node_user_usages {
            self.ledger
                .record_user_usage_logs(*node_id, user_usages, bucket)
                .await?;
        }

        report.users_charged = usages.len();
        report.charged_bytes = usages
            .iter()
            .fold(0u64, |sum, usage| sum.saturating_add(usage.bytes));

        info!(
            "Recorded {} bytes for {} users from {} nodes ({} failed)",
            report.charged_bytes, report.users_charged, report.nodes_polled, report.nodes_failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::UserUsage;
    use crate::entity::{node_usage, node_user_usage, user};
    use crate::node::test_support::{FakeBehavior, FakeNode, directional};
    use crate::notifier::NoopNotifier;
    use crate::schema::test_support::temp_database;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use common::{StatRecord, TrafficCalculationMethod};
    use parking_lot::Mutex;
    use sea_orm::*;

    const SHORT: Duration = Duration::from_millis(200);

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 8, 10)
            .unwrap()
            .and_hms_opt(13, 42, 5)
            .unwrap()
    }

    async fn create_user(db: &DatabaseConnection, username: &str) -> i64 {
        user::ActiveModel {
            username: Set(username.to_string()),
            used_traffic: Set(0),
            lifetime_used_traffic: Set(0),
            data_limit: Set(None),
            online_at: Set(None),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
        .id
    }

    fn recorder(db: &DatabaseConnection, registry: NodeRegistry) -> UsageRecorder {
        UsageRecorder::new(
            registry,
            UsageLedger::new(db.clone()),
            Arc::new(NoopNotifier),
        )
        .with_node_timeout(SHORT)
    }

    async fn node_rows(db: &DatabaseConnection) -> Vec<node_usage::Model> {
        node_usage::Entity::find()
            .order_by_asc(node_usage::Column::NodeId)
            .all(db)
            .await
            .unwrap()
    }

    async fn node_user_rows(db: &DatabaseConnection) -> Vec<(i64, i64, i64)> {
        node_user_usage::Entity::find()
            .order_by_asc(node_user_usage::Column::NodeId)
            .order_by_asc(node_user_usage::Column::UserId)
            .all(db)
            .await
            .unwrap()
            .into_iter()
            .map(|row| (row.node_id, row.user_id, row.used_traffic))
            .collect()
    }

    #[tokio::test]
    async fn test_cycle_across_methods_and_coefficients() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "alice").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 100, 50)]),
        ));
        registry.register(FakeNode::arc(
            2,
            2.0,
            TrafficCalculationMethod::UplinkOnly,
            FakeBehavior::Records(vec![directional(uid, 10, 999)]),
        ));

        let report = recorder(&db, registry)
            .record_user_usages_at(now())
            .await
            .unwrap();
        assert_eq!(
            report,
            CycleReport {
                nodes_polled: 2,
                nodes_failed: 0,
                users_charged: 1,
                charged_bytes: 170,
            }
        );

        let alice = user::Entity::find_by_id(uid).one(&db).await.unwrap().unwrap();
        assert_eq!(alice.used_traffic, 170);
        assert_eq!(alice.lifetime_used_traffic, 170);
        assert_eq!(alice.online_at, Some(now()));

        let nodes = node_rows(&db).await;
        assert_eq!(nodes.len(), 2);
        assert_eq!((nodes[0].uplink, nodes[0].downlink), (100, 50));
        assert_eq!((nodes[1].uplink, nodes[1].downlink), (10, 0));
        assert!(nodes.iter().all(|row| row.created_at == hour_bucket(now())));

        assert_eq!(node_user_rows(&db).await, vec![(1, uid, 150), (2, uid, 20)]);
    }

    #[tokio::test]
    async fn test_timed_out_node_does_not_affect_others() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "bob").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Hang,
        ));
        registry.register(FakeNode::arc(
            2,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 30, 12)]),
        ));

        let report = recorder(&db, registry)
            .record_user_usages_at(now())
            .await
            .unwrap();
        assert_eq!(report.nodes_failed, 1);
        assert_eq!(report.charged_bytes, 42);

        let bob = user::Entity::find_by_id(uid).one(&db).await.unwrap().unwrap();
        assert_eq!(bob.used_traffic, 42);

        let nodes = node_rows(&db).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, 2);
        assert_eq!(node_user_rows(&db).await, vec![(2, uid, 42)]);
    }

    #[tokio::test]
    async fn test_legacy_record_on_uplink_only_node() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "carol").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::UplinkOnly,
            FakeBehavior::Records(vec![StatRecord::Legacy {
                user_id: uid,
                value: 42,
            }]),
        ));

        recorder(&db, registry)
            .record_user_usages_at(now())
            .await
            .unwrap();

        let carol = user::Entity::find_by_id(uid).one(&db).await.unwrap().unwrap();
        assert_eq!(carol.used_traffic, 42);
        assert_eq!(node_user_rows(&db).await, vec![(1, uid, 42)]);
    }

    #[tokio::test]
    async fn test_cycle_without_usage_writes_nothing() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "dave").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 0, 0)]),
        ));
        registry.register(FakeNode::arc(
            2,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Fail,
        ));

        let notifier = Arc::new(RecordingNotifier::default());
        let recorder = UsageRecorder::new(registry, UsageLedger::new(db.clone()), notifier.clone())
            .with_node_timeout(SHORT);
        let report = recorder.record_user_usages_at(now()).await.unwrap();

        assert_eq!(report.users_charged, 0);
        assert_eq!(report.nodes_failed, 1);
        assert!(notifier.calls.lock().is_empty());
        assert!(node_rows(&db).await.is_empty());
        assert!(node_user_rows(&db).await.is_empty());
        let dave = user::Entity::find_by_id(uid).one(&db).await.unwrap().unwrap();
        assert_eq!(dave.online_at, None);
    }

    #[tokio::test]
    async fn test_zero_coefficient_node_charges_nobody() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "grace").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            0.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 100, 50)]),
        ));

        let notifier = Arc::new(RecordingNotifier::default());
        let recorder = UsageRecorder::new(registry, UsageLedger::new(db.clone()), notifier.clone())
            .with_node_timeout(SHORT);
        let report = recorder.record_user_usages_at(now()).await.unwrap();

        assert_eq!(report.users_charged, 0);
        assert_eq!(report.charged_bytes, 0);
        assert!(notifier.calls.lock().is_empty());

        let nodes = node_rows(&db).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!((nodes[0].uplink, nodes[0].downlink), (100, 50));
        assert!(node_user_rows(&db).await.is_empty());

        let grace = user::Entity::find_by_id(uid).one(&db).await.unwrap().unwrap();
        assert_eq!(grace.used_traffic, 0);
        assert_eq!(grace.online_at, None);
    }

    #[tokio::test]
    async fn test_repeated_cycles_in_one_hour_share_rows() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "erin").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 5, 5)]),
        ));
        let recorder = recorder(&db, registry);

        recorder.record_user_usages_at(now()).await.unwrap();
        recorder
            .record_user_usages_at(now() + chrono::Duration::minutes(10))
            .await
            .unwrap();

        assert_eq!(node_user_rows(&db).await, vec![(1, uid, 20)]);
        let nodes = node_rows(&db).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].uplink + nodes[0].downlink, 20);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<Vec<(UserUsage, i64)>>>,
    }

    #[async_trait]
    impl UsageNotifier for RecordingNotifier {
        async fn usage_recorded(&self, db: &DatabaseConnection, usages: &[UserUsage]) -> Result<()> {
            let mut seen = Vec::new();
            for usage in usages {
                let stored = user::Entity::find_by_id(usage.user_id)
                    .one(db)
                    .await?
                    .map(|u| u.used_traffic)
                    .unwrap_or_default();
                seen.push((*usage, stored));
            }
            self.calls.lock().push(seen);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notifier_sees_usage_before_it_is_charged() {
        let (_dir, db) = temp_database().await;
        let uid = create_user(&db, "frank").await;

        let registry = NodeRegistry::new();
        registry.register(FakeNode::arc(
            1,
            1.0,
            TrafficCalculationMethod::Sum,
            FakeBehavior::Records(vec![directional(uid, 60, 40)]),
        ));

        let notifier = Arc::new(RecordingNotifier::default());
        let recorder = UsageRecorder::new(registry, UsageLedger::new(db.clone()), notifier.clone())
            .with_node_timeout(SHORT);
        recorder.record_user_usages_at(now()).await.unwrap();
        recorder.record_user_usages_at(now()).await.unwrap();

        let calls = notifier.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            vec![(
                UserUsage {
                    user_id: uid,
                    bytes: 100
                },
                0
            )]
        );
        assert_eq!(calls[1][0].1, 100);
    }
}
