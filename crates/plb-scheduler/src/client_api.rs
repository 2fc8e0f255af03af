//! Client-driven one-shot actions.
//!
//! Each trigger validates the request against a fresh snapshot of the
//! failover unit's domain, builds the single movement and sends it through
//! the emitter like any refresh output, labelled with a `ClientApi*`
//! scheduler action.

use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use plb_core::{FailoverUnitId, FailoverUnitMovement, NodeId, PlbMovementIgnoredReason, ReplicaRole, SchedulerActionKind};
use plb_placement::state::WorkingReplica;
use plb_placement::{Objective, Placement, PlacementState, build_movements, check_placement, check_swap};

use crate::engine::PlacementAndLoadBalancer;
use crate::error::{SchedulerError, SchedulerResult};

fn node_index(state: &PlacementState, node: &str) -> SchedulerResult<usize> {
    state
        .node_index(node)
        .ok_or_else(|| SchedulerError::NodeNotFound(node.to_string()))
}

fn replica_in_role(
    state: &PlacementState,
    id: &FailoverUnitId,
    fu: usize,
    node: &str,
    role: ReplicaRole,
) -> SchedulerResult<usize> {
    let idx = node_index(state, node)?;
    let role_name = match role {
        ReplicaRole::Primary => "primary",
        ReplicaRole::Secondary => "secondary",
        ReplicaRole::Idle => "idle",
        ReplicaRole::Standby => "standby",
    };
    match state.replica_on(fu, idx) {
        Some(replica) if replica.role == role => Ok(idx),
        _ => Err(SchedulerError::ReplicaNotFound {
            failover_unit: *id,
            node: node.to_string(),
            role: role_name,
        }),
    }
}

/// Turn the secondary on `node` into the primary.
fn promote(state: &mut PlacementState, fu: usize, node: usize) -> SchedulerResult<()> {
    match state.primary(fu).map(|r| r.node) {
        Some(primary) => {
            check_swap(state, fu, primary, node).map_err(SchedulerError::ConstraintNotSatisfied)?;
            state.swap_roles(fu, primary, node);
        }
        None => {
            let replica = state.remove_replica(fu, node);
            state.restore_replica(
                fu,
                WorkingReplica {
                    role: ReplicaRole::Primary,
                    ..replica
                },
            );
        }
    }
    Ok(())
}

impl PlacementAndLoadBalancer {
    fn client_action(
        &self,
        id: &FailoverUnitId,
        scheduler_action: SchedulerActionKind,
        apply: impl FnOnce(&mut PlacementState, usize) -> SchedulerResult<()>,
    ) -> SchedulerResult<FailoverUnitMovement> {
        let now = Instant::now();
        let decision_id = Uuid::new_v4();
        let config = self.config.read().clone();

        let (outcome, movement) = {
            let model = self.model.read();
            let snapshot = model
                .domain_of_failover_unit(id)
                .and_then(|domain| model.snapshot(domain))
                .ok_or(SchedulerError::FailoverUnitNotFound(*id))?;
            let mut placement = PlacementState::new(&snapshot, &config);
            let fu = placement
                .failover_unit_index(id)
                .ok_or(SchedulerError::FailoverUnitNotFound(*id))?;
            if placement.fu(fu).is_in_transition {
                return Err(SchedulerError::MovementDropped(
                    PlbMovementIgnoredReason::FailoverUnitIsChanging,
                ));
            }
            apply(&mut placement, fu)?;

            let table = build_movements(&placement, scheduler_action, &[]);
            let movement = table
                .get(id)
                .cloned()
                .ok_or(SchedulerError::MovementDropped(PlbMovementIgnoredReason::Invalid))?;
            let outcome = self.state.lock().emitter.emit(table, &model, &config, now, decision_id);
            (outcome, movement)
        };

        self.notify(&outcome, decision_id);
        if let Some(dropped) = outcome.dropped.iter().find(|d| d.failover_unit_id == *id) {
            debug!(failover_unit = %id, action = %scheduler_action, reason = %dropped.reason, "client movement dropped");
            return Err(SchedulerError::MovementDropped(dropped.reason));
        }
        info!(failover_unit = %id, action = %scheduler_action, %decision_id, "client movement emitted");
        Ok(movement)
    }

    /// Make the secondary on `node` the primary of the failover unit.
    pub fn trigger_promote_to_primary(&self, id: &FailoverUnitId, node: &str) -> SchedulerResult<FailoverUnitMovement> {
        self.client_action(id, SchedulerActionKind::ClientApiPromoteToPrimary, |state, fu| {
            if !state.service(fu).is_stateful {
                return Err(SchedulerError::NotStateful(state.service(fu).name.clone()));
            }
            let target = replica_in_role(state, id, fu, node, ReplicaRole::Secondary)?;
            promote(state, fu, target)
        })
    }

    /// Move the primary from `from` to `to`: a swap when `to` holds a
    /// secondary, a primary move otherwise.
    pub fn trigger_swap_primary(&self, id: &FailoverUnitId, from: &str, to: &str) -> SchedulerResult<FailoverUnitMovement> {
        self.client_action(id, SchedulerActionKind::ClientApiMovePrimary, |state, fu| {
            if !state.service(fu).is_stateful {
                return Err(SchedulerError::NotStateful(state.service(fu).name.clone()));
            }
            let source = replica_in_role(state, id, fu, from, ReplicaRole::Primary)?;
            let target = node_index(state, to)?;
            if state.hosts(fu, target) {
                check_swap(state, fu, source, target).map_err(SchedulerError::ConstraintNotSatisfied)?;
                state.swap_roles(fu, source, target);
            } else {
                check_placement(state, fu, target, Placement::Move { from: source }, false)
                    .map_err(SchedulerError::ConstraintNotSatisfied)?;
                state.move_replica(fu, source, target);
            }
            Ok(())
        })
    }

    /// Move the secondary (or stateless instance) on `from` to `to`.
    pub fn trigger_move_secondary(&self, id: &FailoverUnitId, from: &str, to: &str) -> SchedulerResult<FailoverUnitMovement> {
        self.client_action(id, SchedulerActionKind::ClientApiMoveSecondary, |state, fu| {
            let source = replica_in_role(state, id, fu, from, ReplicaRole::Secondary)?;
            let target = node_index(state, to)?;
            check_placement(state, fu, target, Placement::Move { from: source }, false)
                .map_err(SchedulerError::ConstraintNotSatisfied)?;
            state.move_replica(fu, source, target);
            Ok(())
        })
    }

    /// The candidate whose promotion leaves the domain best balanced.
    /// Candidates without a ready secondary, or whose promotion breaks a
    /// constraint, are skipped. Ties go to the lowest node id.
    pub fn compare_node_for_promotion(
        &self,
        id: &FailoverUnitId,
        candidates: &[NodeId],
    ) -> SchedulerResult<Option<NodeId>> {
        let config = self.config.read().clone();
        let model = self.model.read();
        let snapshot = model
            .domain_of_failover_unit(id)
            .and_then(|domain| model.snapshot(domain))
            .ok_or(SchedulerError::FailoverUnitNotFound(*id))?;
        let objective = Objective::new(&snapshot, &config);
        let mut state = PlacementState::new(&snapshot, &config);
        let fu = state
            .failover_unit_index(id)
            .ok_or(SchedulerError::FailoverUnitNotFound(*id))?;
        if !state.service(fu).is_stateful {
            return Err(SchedulerError::NotStateful(state.service(fu).name.clone()));
        }

        let mut sorted: Vec<&NodeId> = candidates.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut best: Option<(f64, &NodeId)> = None;
        for candidate in sorted {
            let Some(node) = state.node_index(candidate) else {
                continue;
            };
            let ready = state
                .replica_on(fu, node)
                .is_some_and(|r| r.role == ReplicaRole::Secondary && !r.in_build);
            if !ready {
                continue;
            }
            let primary = state.primary(fu).map(|r| r.node);
            let score = match primary {
                Some(p) => {
                    if check_swap(&state, fu, p, node).is_err() {
                        continue;
                    }
                    state.swap_roles(fu, p, node);
                    let score = objective.score(&state);
                    state.swap_roles(fu, node, p);
                    score
                }
                None => {
                    let replica = state.remove_replica(fu, node);
                    state.restore_replica(
                        fu,
                        WorkingReplica {
                            role: ReplicaRole::Primary,
                            ..replica.clone()
                        },
                    );
                    let score = objective.score(&state);
                    state.remove_replica(fu, node);
                    state.restore_replica(fu, replica);
                    score
                }
            };
            if best.is_none_or(|(b, _)| score < b) {
                best = Some((score, candidate));
            }
        }
        Ok(best.map(|(_, node)| node.clone()))
    }
}
