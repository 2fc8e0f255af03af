//! A failover authority that only logs.
//!
//! The daemon has no failover manager to talk to; it reports every
//! callback through tracing so a seeded cluster can be watched converging.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use plb_core::{DecisionId, DroppedMovement, FailoverUnitMovementTable};
use plb_scheduler::FailoverAuthority;

#[derive(Default)]
pub struct LoggingAuthority {
    emitted: AtomicU64,
}

impl LoggingAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Movements reported since start.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl FailoverAuthority for LoggingAuthority {
    fn process_movements(&self, movements: &FailoverUnitMovementTable, decision_id: DecisionId) {
        self.emitted.fetch_add(movements.len() as u64, Ordering::Relaxed);
        for (id, movement) in movements {
            for action in &movement.actions {
                info!(
                    decision = %decision_id,
                    failover_unit = %id,
                    service = %movement.service_name,
                    kind = ?action.kind,
                    scheduler_action = %action.scheduler_action,
                    source = action.source_node.as_deref().unwrap_or("-"),
                    target = action.target_node.as_deref().unwrap_or("-"),
                    "movement"
                );
            }
        }
    }

    fn on_movements_dropped(&self, dropped: &[DroppedMovement]) {
        for drop in dropped {
            warn!(
                decision = %drop.decision_id,
                failover_unit = %drop.failover_unit_id,
                reason = drop.reason.as_str(),
                "movement dropped"
            );
        }
    }

    fn update_target_replica_count(&self, service: &str, target: u32) {
        info!(service, target, "instance count changed by auto-scaling");
    }

    fn update_app_upgrade_safety_check(&self, application: &str) {
        info!(application, "application upgrade passed the governance safety check");
    }
}

#[cfg(test)]
mod tests {
    use plb_core::{ActionKind, FailoverUnitMovement, PlbAction, SchedulerActionKind};

    use super::*;

    #[test]
    fn counts_emitted_movements() {
        let authority = LoggingAuthority::new();
        let id = uuid::Uuid::from_u128(9);
        let mut table = FailoverUnitMovementTable::new();
        table.insert(
            id,
            FailoverUnitMovement {
                failover_unit_id: id,
                service_name: "fabric:/svc".into(),
                is_stateful: true,
                version: 1,
                is_in_transition: false,
                actions: vec![PlbAction {
                    source_node: None,
                    target_node: Some("N1".into()),
                    kind: ActionKind::AddSecondary,
                    scheduler_action: SchedulerActionKind::NewReplicaPlacement,
                }],
            },
        );
        authority.process_movements(&table, uuid::Uuid::new_v4());
        authority.process_movements(&table, uuid::Uuid::new_v4());
        assert_eq!(authority.emitted(), 2);
    }
}
