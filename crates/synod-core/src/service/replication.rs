//! Synchronous replication of member writes
//!
//! Every mutation applied on a source member is pushed to all other Active
//! members in ascending id order. Delivery to each target is independent: a
//! failing target is recorded and the remaining targets still receive the
//! write.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::model::{Entity, EntityKind, MemberId, Mutation, Operation};

use super::registry::NodeRegistry;

/// Delivers a mutation to one replication target
pub trait ReplicaTransport: Send + Sync {
    fn deliver(&self, target: MemberId, mutation: &Mutation) -> Result<()>;
}

/// In-process transport: applies the mutation straight to the target's dataset
pub struct LocalTransport {
    registry: Arc<NodeRegistry>,
}

impl LocalTransport {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }
}

impl ReplicaTransport for LocalTransport {
    fn deliver(&self, target: MemberId, mutation: &Mutation) -> Result<()> {
        self.registry.with_member_mut(target, |member| {
            // A crashed member's dataset stays frozen until it resyncs
            if !member.is_active() {
                return Err(ClusterError::MemberUnavailable(target));
            }
            member.dataset.apply(mutation);
            Ok(())
        })?
    }
}

/// A target that did not receive a mutation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationFailure {
    pub target: MemberId,
    pub reason: String,
}

/// Per-call replication outcome
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationReport {
    pub source: MemberId,
    pub operation: Operation,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub target_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<ReplicationFailure>,
}

impl ReplicationReport {
    pub fn is_complete(&self) -> bool {
        self.failure_count == 0
    }

    /// `ReplicationPartialFailure` when some targets were missed
    pub fn partial_failure(&self) -> Option<ClusterError> {
        (self.failure_count > 0).then(|| ClusterError::ReplicationPartialFailure {
            succeeded: self.success_count,
            failed: self.failure_count,
            targets: self.target_count,
        })
    }
}

/// Dataset-size mismatch between the coordinator and another Active member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyMismatch {
    pub member_id: MemberId,
    pub expected_size: usize,
    pub actual_size: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub coordinator_id: Option<MemberId>,
    pub checked: usize,
    pub mismatches: Vec<ConsistencyMismatch>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Replication engine
pub struct ReplicationEngine {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn ReplicaTransport>,
}

impl ReplicationEngine {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        let transport = Arc::new(LocalTransport::new(registry.clone()));
        Self::with_transport(registry, transport)
    }

    pub fn with_transport(registry: Arc<NodeRegistry>, transport: Arc<dyn ReplicaTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Active members other than `source`, ascending
    pub fn targets(&self, source: MemberId) -> Vec<MemberId> {
        self.registry
            .active_ids()
            .into_iter()
            .filter(|id| *id != source)
            .collect()
    }

    /// Push `operation` on `payload` from `source` to every other Active member
    pub fn replicate(&self, operation: Operation, payload: &Entity, source: MemberId) -> ReplicationReport {
        let mutation = Mutation::new(operation, payload.clone());
        let targets = self.targets(source);

        let mut report = ReplicationReport {
            source,
            operation,
            entity_kind: payload.kind(),
            entity_id: payload.id().to_string(),
            target_count: targets.len(),
            success_count: 0,
            failure_count: 0,
            failures: Vec::new(),
        };

        for target in targets {
            match self.transport.deliver(target, &mutation) {
                Ok(()) => {
                    report.success_count += 1;
                    debug!(
                        "Replicated {} {} '{}' from {} to {}",
                        operation,
                        report.entity_kind,
                        report.entity_id,
                        source,
                        target
                    );
                }
                Err(e) => {
                    report.failure_count += 1;
                    metrics::counter!("synod_replication_failures_total").increment(1);
                    warn!(
                        "Replication of {} '{}' from {} to {} failed: {}",
                        report.entity_kind, report.entity_id, source, target, e
                    );
                    report.failures.push(ReplicationFailure {
                        target,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Overwrite `member_id`'s dataset with a deep copy of the coordinator's.
    /// Returns the number of entities copied.
    pub fn sync_with_leader(&self, member_id: MemberId, coordinator_id: MemberId) -> Result<usize> {
        if !self.registry.contains(member_id) {
            return Err(ClusterError::MemberNotFound(member_id));
        }
        let snapshot = self.registry.dataset(coordinator_id)?;
        let size = snapshot.len();

        if member_id != coordinator_id {
            self.registry.replace_dataset(member_id, snapshot)?;
        }

        info!(
            "Synced {} from coordinator {} ({} entities)",
            member_id, coordinator_id, size
        );
        Ok(size)
    }

    /// Compare dataset sizes between the coordinator and every other Active
    /// member. Equal sizes do not prove equal content.
    pub fn check_consistency(&self) -> ConsistencyReport {
        let Some(coordinator_id) = self.registry.coordinator_id() else {
            return ConsistencyReport::default();
        };
        let Ok(expected_size) = self.registry.dataset(coordinator_id).map(|d| d.len()) else {
            return ConsistencyReport::default();
        };

        let mut report = ConsistencyReport {
            coordinator_id: Some(coordinator_id),
            checked: 0,
            mismatches: Vec::new(),
        };

        for member in self.registry.list_active() {
            if member.id == coordinator_id {
                continue;
            }
            report.checked += 1;
            let actual_size = member.dataset.len();
            if actual_size != expected_size {
                report.mismatches.push(ConsistencyMismatch {
                    member_id: member.id,
                    expected_size,
                    actual_size,
                });
            }
        }

        if !report.is_consistent() {
            warn!(
                "Consistency check found {} mismatched member(s)",
                report.mismatches.len()
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dataset, MemberStatus, Order, Product};

    fn product(id: &str, stock: u32) -> Product {
        Product {
            id: id.to_string(),
            name: id.to_string(),
            price: 2.5,
            stock,
        }
    }

    fn registry(n: u32) -> Arc<NodeRegistry> {
        let mut seed = Dataset::default();
        seed.products.insert("p-1".to_string(), product("p-1", 10));
        Arc::new(NodeRegistry::new((1..=n).map(MemberId), &seed))
    }

    /// Fails delivery to one target, delegating the rest
    struct FailingTransport {
        inner: LocalTransport,
        failing: MemberId,
    }

    impl ReplicaTransport for FailingTransport {
        fn deliver(&self, target: MemberId, mutation: &Mutation) -> Result<()> {
            if target == self.failing {
                return Err(ClusterError::MemberUnavailable(target));
            }
            self.inner.deliver(target, mutation)
        }
    }

    #[test]
    fn test_replicate_reaches_all_targets_except_source() {
        let registry = registry(4);
        let engine = ReplicationEngine::new(registry.clone());

        let report = engine.replicate(Operation::Create, &Entity::Product(product("p-2", 3)), MemberId(2));

        assert_eq!(report.target_count, 3);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failure_count, 0);
        assert!(report.partial_failure().is_none());
        // Source is never a target
        assert!(registry.dataset(MemberId(2)).unwrap().product("p-2").is_none());
        for id in [1, 3, 4] {
            assert!(registry.dataset(MemberId(id)).unwrap().product("p-2").is_some());
        }
    }

    #[test]
    fn test_failed_target_does_not_abort_batch() {
        let registry = registry(5);
        let transport = Arc::new(FailingTransport {
            inner: LocalTransport::new(registry.clone()),
            failing: MemberId(2),
        });
        let engine = ReplicationEngine::with_transport(registry.clone(), transport);

        let report = engine.replicate(Operation::Update, &Entity::Product(product("p-1", 1)), MemberId(1));

        assert_eq!(report.target_count, 4);
        assert_eq!(report.success_count, 3);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.failures[0].target, MemberId(2));
        assert!(matches!(
            report.partial_failure(),
            Some(ClusterError::ReplicationPartialFailure {
                succeeded: 3,
                failed: 1,
                targets: 4
            })
        ));
        for id in [3, 4, 5] {
            let stock = registry.dataset(MemberId(id)).unwrap().product("p-1").map(|p| p.stock);
            assert_eq!(stock, Some(1));
        }
        let stock = registry.dataset(MemberId(2)).unwrap().product("p-1").map(|p| p.stock);
        assert_eq!(stock, Some(10));
    }

    #[test]
    fn test_crashed_members_are_not_targets() {
        let registry = registry(3);
        registry.set_status(MemberId(3), MemberStatus::Crashed).unwrap();
        let engine = ReplicationEngine::new(registry.clone());

        let order = Order {
            id: "o-1".to_string(),
            product_id: "p-1".to_string(),
            quantity: 4,
            customer: "c".to_string(),
            created_at: 0,
        };
        let report = engine.replicate(Operation::Create, &Entity::Order(order), MemberId(1));

        assert_eq!(report.target_count, 1);
        let target = registry.dataset(MemberId(2)).unwrap();
        assert_eq!(target.product("p-1").map(|p| p.stock), Some(6));
        // Crashed member stays frozen
        let frozen = registry.dataset(MemberId(3)).unwrap();
        assert_eq!(frozen.product("p-1").map(|p| p.stock), Some(10));
        assert!(frozen.order("o-1").is_none());
    }

    #[test]
    fn test_sync_with_leader_is_deep_copy() {
        let registry = registry(3);
        let engine = ReplicationEngine::new(registry.clone());
        registry
            .with_member_mut(MemberId(3), |m| {
                m.dataset.products.insert("p-9".to_string(), product("p-9", 9));
            })
            .unwrap();

        let copied = engine.sync_with_leader(MemberId(1), MemberId(3)).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(
            registry.dataset(MemberId(1)).unwrap(),
            registry.dataset(MemberId(3)).unwrap()
        );

        // Later coordinator writes do not leak into the synced copy
        registry
            .with_member_mut(MemberId(3), |m| {
                m.dataset.products.get_mut("p-9").unwrap().stock = 0;
            })
            .unwrap();
        let synced = registry.dataset(MemberId(1)).unwrap();
        assert_eq!(synced.product("p-9").map(|p| p.stock), Some(9));
    }

    #[test]
    fn test_sync_with_unknown_member() {
        let registry = registry(2);
        let engine = ReplicationEngine::new(registry);
        assert_eq!(
            engine.sync_with_leader(MemberId(7), MemberId(2)).unwrap_err(),
            ClusterError::MemberNotFound(MemberId(7))
        );
        assert_eq!(
            engine.sync_with_leader(MemberId(1), MemberId(8)).unwrap_err(),
            ClusterError::MemberNotFound(MemberId(8))
        );
    }

    #[test]
    fn test_check_consistency_compares_sizes() {
        let registry = registry(3);
        let engine = ReplicationEngine::new(registry.clone());
        assert_eq!(engine.check_consistency(), ConsistencyReport::default());

        registry.mark_coordinator(MemberId(3)).unwrap();
        registry
            .with_member_mut(MemberId(1), |m| m.dataset.products.clear())
            .unwrap();
        // Same size, different content: not detected
        registry
            .with_member_mut(MemberId(2), |m| {
                m.dataset.products.get_mut("p-1").unwrap().stock = 0;
            })
            .unwrap();

        let report = engine.check_consistency();
        assert_eq!(report.coordinator_id, Some(MemberId(3)));
        assert_eq!(report.checked, 2);
        assert_eq!(
            report.mismatches,
            vec![ConsistencyMismatch {
                member_id: MemberId(1),
                expected_size: 1,
                actual_size: 0,
            }]
        );
    }
}
