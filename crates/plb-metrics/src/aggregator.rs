//! Statistics aggregator: counters and gauges behind a reader/writer lock.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use plb_core::{FailoverUnitMovement, PlbMovementIgnoredReason};

/// Point-in-time gauges of the scheduled cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterGauges {
    pub nodes: u64,
    pub up_nodes: u64,
    pub services: u64,
    pub failover_units: u64,
    pub domains: u64,
    pub governed_service_packages: u64,
    pub cpu_cores_used: f64,
    pub cpu_cores_capacity: f64,
    pub memory_in_mb_used: i64,
    pub memory_in_mb_capacity: i64,
    pub defragmentation_metrics: u64,
    pub partition_scaled_services: u64,
    pub instance_scaled_services: u64,
    pub pending_repartitions: u64,
    pub unplaced_replicas: u64,
}

/// A snapshot of everything the aggregator tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlbStatistics {
    /// Milliseconds since the Unix epoch.
    pub epoch_ms: u64,
    pub gauges: ClusterGauges,
    /// Emitted movements per scheduler action.
    pub movements: BTreeMap<String, u64>,
    /// Emitted replica actions per action kind.
    pub actions: BTreeMap<String, u64>,
    /// Dropped movements per reason.
    pub drops: BTreeMap<String, u64>,
    pub refreshes: u64,
    pub abandoned_refreshes: u64,
    pub repartition_failures: u64,
}

#[derive(Default)]
pub struct StatisticsAggregator {
    inner: RwLock<PlbStatistics>,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_movement(&self, movement: &FailoverUnitMovement) {
        let mut stats = self.inner.write();
        if let Some(first) = movement.actions.first() {
            *stats
                .movements
                .entry(first.scheduler_action.as_str().to_string())
                .or_insert(0) += 1;
        }
        for action in &movement.actions {
            *stats.actions.entry(action.kind.as_str().to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_drops(&self, reason: PlbMovementIgnoredReason, count: u64) {
        if count == 0 {
            return;
        }
        *self
            .inner
            .write()
            .drops
            .entry(reason.as_str().to_string())
            .or_insert(0) += count;
    }

    pub fn record_refresh(&self, abandoned_domains: u64) {
        let mut stats = self.inner.write();
        stats.refreshes += 1;
        stats.abandoned_refreshes += abandoned_domains;
    }

    pub fn record_repartition_failure(&self) {
        self.inner.write().repartition_failures += 1;
    }

    pub fn set_gauges(&self, gauges: ClusterGauges) {
        self.inner.write().gauges = gauges;
    }

    pub fn drop_count(&self, reason: PlbMovementIgnoredReason) -> u64 {
        self.inner.read().drops.get(reason.as_str()).copied().unwrap_or(0)
    }

    pub fn movement_count(&self) -> u64 {
        self.inner.read().movements.values().sum()
    }

    /// Copy of the current statistics stamped with the wall clock.
    pub fn snapshot(&self) -> PlbStatistics {
        let mut stats = self.inner.read().clone();
        stats.epoch_ms = epoch_millis();
        stats
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use plb_core::{ActionKind, PlbAction, SchedulerActionKind};
    use uuid::Uuid;

    use super::*;

    fn movement(action: SchedulerActionKind, kinds: &[ActionKind]) -> FailoverUnitMovement {
        FailoverUnitMovement {
            failover_unit_id: Uuid::new_v4(),
            service_name: "fabric:/app/svc".into(),
            is_stateful: true,
            version: 1,
            is_in_transition: false,
            actions: kinds
                .iter()
                .map(|k| PlbAction::new(*k, Some("N1".into()), Some("N2".into()), action))
                .collect(),
        }
    }

    #[test]
    fn counts_movements_and_actions() {
        let stats = StatisticsAggregator::new();
        stats.record_movement(&movement(
            SchedulerActionKind::LoadBalancing,
            &[ActionKind::SwapPrimarySecondary, ActionKind::MoveSecondary],
        ));
        stats.record_movement(&movement(SchedulerActionKind::LoadBalancing, &[ActionKind::MoveSecondary]));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.movements["LoadBalancing"], 2);
        assert_eq!(snapshot.actions["MoveSecondary"], 2);
        assert_eq!(snapshot.actions["SwapPrimarySecondary"], 1);
        assert_eq!(stats.movement_count(), 2);
        assert!(snapshot.epoch_ms > 0);
    }

    #[test]
    fn counts_drops_per_reason() {
        let stats = StatisticsAggregator::new();
        stats.record_drops(PlbMovementIgnoredReason::VersionMismatch, 2);
        stats.record_drops(PlbMovementIgnoredReason::VersionMismatch, 1);
        stats.record_drops(PlbMovementIgnoredReason::ClusterPaused, 0);
        assert_eq!(stats.drop_count(PlbMovementIgnoredReason::VersionMismatch), 3);
        assert_eq!(stats.drop_count(PlbMovementIgnoredReason::ClusterPaused), 0);
        assert!(!stats.snapshot().drops.contains_key("ClusterPaused"));
    }

    #[test]
    fn gauges_replace_previous_values() {
        let stats = StatisticsAggregator::new();
        stats.set_gauges(ClusterGauges {
            nodes: 3,
            ..Default::default()
        });
        stats.set_gauges(ClusterGauges {
            nodes: 4,
            domains: 1,
            ..Default::default()
        });
        let gauges = stats.snapshot().gauges;
        assert_eq!(gauges.nodes, 4);
        assert_eq!(gauges.domains, 1);
        stats.record_refresh(2);
        stats.record_refresh(0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.refreshes, 2);
        assert_eq!(snapshot.abandoned_refreshes, 2);
    }
}
