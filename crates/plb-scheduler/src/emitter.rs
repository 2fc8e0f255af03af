//! Movement emitter and drop ledger.
//!
//! Every candidate movement either leaves through the emitted table or is
//! reported exactly once as a `DroppedMovement` with its reason. The
//! emitter also remembers which failover units have an unacknowledged
//! movement outstanding, so a unit never has two movements in flight.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use plb_core::{
    DecisionId, DroppedMovement, FailoverUnitId, FailoverUnitMovementTable, PlbConfig, PlbMovementIgnoredReason,
    SchedulerActionKind,
};
use plb_model::ClusterModel;
use plb_placement::Violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMovement {
    pub version: u64,
    pub decision_id: DecisionId,
    pub emitted_at: Instant,
    pub action: SchedulerActionKind,
}

#[derive(Debug, Clone, Default)]
pub struct EmitOutcome {
    pub emitted: FailoverUnitMovementTable,
    pub dropped: Vec<DroppedMovement>,
}

impl EmitOutcome {
    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty() && self.dropped.is_empty()
    }

    pub fn merge(&mut self, other: EmitOutcome) {
        self.emitted.extend(other.emitted);
        self.dropped.extend(other.dropped);
    }
}

/// Reason reported for a candidate whose target failed the emission check.
pub fn drop_reason(violation: &Violation) -> PlbMovementIgnoredReason {
    match violation {
        Violation::NodeDown => PlbMovementIgnoredReason::NodePendingClose,
        Violation::NodeDeactivating => PlbMovementIgnoredReason::NodePendingDeactivate,
        Violation::ReplicaNotReady => PlbMovementIgnoredReason::ReplicaNotFound,
        Violation::ReplicaAlreadyOnNode => PlbMovementIgnoredReason::InvalidReplicaState,
        _ => PlbMovementIgnoredReason::ConstraintViolated,
    }
}

#[derive(Debug, Default)]
pub struct MovementEmitter {
    pending: HashMap<FailoverUnitId, PendingMovement>,
    consecutive_drops: HashMap<FailoverUnitId, u32>,
    fm_busy_until: Option<Instant>,
    cluster_paused: bool,
    throttle_window_start: Option<Instant>,
    throttle_count: u32,
}

impl MovementEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter `candidates` and return what may be sent to the authority.
    pub fn emit(
        &mut self,
        candidates: FailoverUnitMovementTable,
        model: &ClusterModel,
        config: &PlbConfig,
        now: Instant,
        decision_id: DecisionId,
    ) -> EmitOutcome {
        let mut outcome = EmitOutcome::default();
        let blanket = if config.drop_all_movements {
            Some(PlbMovementIgnoredReason::DropAllPLBMovementsConfigTrue)
        } else if self.cluster_paused {
            Some(PlbMovementIgnoredReason::ClusterPaused)
        } else if self.is_fm_busy(now) {
            Some(PlbMovementIgnoredReason::FailoverManagerBusy)
        } else {
            None
        };

        for (id, movement) in candidates {
            if let Some(reason) = blanket {
                self.record_drop(&mut outcome, id, reason, decision_id, config);
                continue;
            }
            let Some(entry) = model.failover_unit(&id) else {
                self.record_drop(
                    &mut outcome,
                    id,
                    PlbMovementIgnoredReason::FailoverUnitNotFound,
                    decision_id,
                    config,
                );
                continue;
            };
            if entry.description.version != movement.version {
                self.record_drop(
                    &mut outcome,
                    id,
                    PlbMovementIgnoredReason::VersionMismatch,
                    decision_id,
                    config,
                );
                continue;
            }
            if let Some(previous) = self.pending.get(&id).copied() {
                let age = now.saturating_duration_since(previous.emitted_at);
                if age < config.max_movement_execution_time {
                    self.record_drop(
                        &mut outcome,
                        id,
                        PlbMovementIgnoredReason::FailoverUnitIsChanging,
                        decision_id,
                        config,
                    );
                    continue;
                }
                debug!(failover_unit = %id, age_ms = age.as_millis() as u64, "superseding stale movement");
                outcome.dropped.push(DroppedMovement {
                    failover_unit_id: id,
                    reason: PlbMovementIgnoredReason::FailoverUnitIsChanging,
                    decision_id: previous.decision_id,
                });
            }

            let action = movement
                .actions
                .first()
                .map_or(SchedulerActionKind::NoActionNeeded, |a| a.scheduler_action);
            self.pending.insert(
                id,
                PendingMovement {
                    version: movement.version,
                    decision_id,
                    emitted_at: now,
                    action,
                },
            );
            self.consecutive_drops.remove(&id);
            outcome.emitted.insert(id, movement);
        }
        outcome
    }

    /// Report a candidate dropped before it reached `emit`.
    pub fn reject(
        &mut self,
        outcome: &mut EmitOutcome,
        id: FailoverUnitId,
        reason: PlbMovementIgnoredReason,
        decision_id: DecisionId,
        config: &PlbConfig,
    ) {
        self.record_drop(outcome, id, reason, decision_id, config);
    }

    fn record_drop(
        &mut self,
        outcome: &mut EmitOutcome,
        id: FailoverUnitId,
        reason: PlbMovementIgnoredReason,
        decision_id: DecisionId,
        config: &PlbConfig,
    ) {
        let count = self.consecutive_drops.entry(id).or_insert(0);
        *count += 1;
        if *count == config.consecutive_dropped_movements_warning_limit {
            warn!(failover_unit = %id, %reason, drops = *count, "movements for failover unit keep being dropped");
        }
        outcome.dropped.push(DroppedMovement {
            failover_unit_id: id,
            reason,
            decision_id,
        });
    }

    /// The failover unit changed or its movement was acknowledged.
    pub fn resolve(&mut self, id: &FailoverUnitId) -> Option<PendingMovement> {
        self.pending.remove(id)
    }

    pub fn forget(&mut self, id: &FailoverUnitId) {
        self.pending.remove(id);
        self.consecutive_drops.remove(id);
    }

    pub fn pending(&self, id: &FailoverUnitId) -> Option<&PendingMovement> {
        self.pending.get(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn consecutive_drops(&self, id: &FailoverUnitId) -> u32 {
        self.consecutive_drops.get(id).copied().unwrap_or(0)
    }

    pub fn on_fm_busy(&mut self, now: Instant, config: &PlbConfig) {
        self.fm_busy_until = Some(now + config.fm_busy_backoff);
    }

    pub fn is_fm_busy(&self, now: Instant) -> bool {
        self.fm_busy_until.is_some_and(|until| now < until)
    }

    pub fn set_cluster_paused(&mut self, paused: bool) {
        self.cluster_paused = paused;
    }

    pub fn is_cluster_paused(&self) -> bool {
        self.cluster_paused
    }

    /// Balancing moves still allowed in the current throttle window.
    pub fn throttle_remaining(&mut self, config: &PlbConfig, now: Instant) -> usize {
        if config.global_movement_throttle_threshold == 0 {
            return usize::MAX;
        }
        let expired = self.throttle_window_start.is_none_or(|start| {
            now.saturating_duration_since(start) >= config.global_movement_throttle_counting_interval
        });
        if expired {
            self.throttle_window_start = Some(now);
            self.throttle_count = 0;
        }
        config.global_movement_throttle_threshold.saturating_sub(self.throttle_count) as usize
    }

    pub fn record_balancing(&mut self, moves: usize, now: Instant) {
        if moves == 0 {
            return;
        }
        self.throttle_window_start.get_or_insert(now);
        self.throttle_count = self.throttle_count.saturating_add(moves as u32);
    }
}
