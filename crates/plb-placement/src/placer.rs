//! New replica placement and extra replica removal.
//!
//! Failover units are visited with affinity parents before their children,
//! each group in ascending id order. Every missing replica goes to the
//! feasible node with the best objective score, ties broken by the lowest
//! node id. Nodes that already hold the service package's container images
//! are preferred.

use std::collections::BTreeMap;

use tracing::debug;

use plb_core::ReplicaRole;

use crate::SearchBudget;
use crate::constraints::{Placement, Violation, check_placement};
use crate::objective::Objective;
use crate::state::PlacementState;

/// A replica that could not be placed, with the violations that ruled out
/// each node, counted per violation.
#[derive(Debug, Clone, PartialEq)]
pub struct UnplacedReplica {
    pub fu: usize,
    pub role: ReplicaRole,
    pub reasons: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacementOutcome {
    pub placed: usize,
    pub dropped: usize,
    /// Existing replicas relocated to make room for new ones.
    pub relocated: usize,
    pub unplaced: Vec<UnplacedReplica>,
}

/// Visit order of the failover units: parents first, children after.
fn visit_order(state: &PlacementState) -> Vec<usize> {
    let (mut parents, children): (Vec<usize>, Vec<usize>) = (0..state.failover_unit_count())
        .partition(|fu| state.service(*fu).affinity_parent.is_none());
    parents.extend(children);
    parents
}

/// Role of the next replica a unit needs.
fn next_role(state: &PlacementState, fu: usize) -> ReplicaRole {
    if state.service(fu).is_stateful && state.primary(fu).is_none() && state.replicas(fu).is_empty() {
        ReplicaRole::Primary
    } else {
        ReplicaRole::Secondary
    }
}

/// Bring every unit to its target replica count.
///
/// With `allow_move`, a replica that fits nowhere only for lack of capacity
/// may displace one existing replica of another unit.
pub fn place_new_replicas(
    state: &mut PlacementState,
    objective: &Objective,
    budget: &mut SearchBudget,
    allow_move: bool,
) -> PlacementOutcome {
    let mut outcome = PlacementOutcome::default();
    for fu in visit_order(state) {
        if state.fu(fu).is_in_transition || budget.is_exhausted() {
            continue;
        }
        let service = state.service(fu);
        let Some(target) = state.fu(fu).target(service) else {
            place_on_every_node(state, fu, budget, &mut outcome);
            continue;
        };
        let target = target as usize;

        while state.replicas(fu).len() < target {
            let role = next_role(state, fu);
            match best_target(state, objective, fu, role, budget) {
                Ok(node) => {
                    state.add_replica(fu, node, role);
                    outcome.placed += 1;
                }
                Err(_) if budget.is_exhausted() => break,
                Err(reasons) => {
                    if allow_move && make_room(state, objective, fu, role, budget) {
                        outcome.placed += 1;
                        outcome.relocated += 1;
                        continue;
                    }
                    debug!(
                        failover_unit = %state.fu(fu).id,
                        ?role,
                        ?reasons,
                        "replica cannot be placed"
                    );
                    outcome.unplaced.push(UnplacedReplica { fu, role, reasons });
                    break;
                }
            }
        }

        while state.replicas(fu).len() > target {
            let Some(node) = best_drop(state, objective, fu) else {
                break;
            };
            state.remove_replica(fu, node);
            outcome.dropped += 1;
        }
    }
    outcome
}

fn place_on_every_node(
    state: &mut PlacementState,
    fu: usize,
    budget: &mut SearchBudget,
    outcome: &mut PlacementOutcome,
) {
    for node in 0..state.node_count() {
        if state.hosts(fu, node) || !state.is_node_eligible(node) {
            continue;
        }
        if !budget.spend() {
            return;
        }
        if check_placement(state, fu, node, Placement::New(ReplicaRole::Secondary), true).is_ok() {
            state.add_replica(fu, node, ReplicaRole::Secondary);
            outcome.placed += 1;
        }
    }
}

fn prefers_node(state: &PlacementState, fu: usize, node: usize) -> bool {
    let images = state
        .service(fu)
        .service_package
        .and_then(|p| state.snapshot.service_packages.get(&p))
        .map(|p| p.container_images.as_slice())
        .unwrap_or_default();
    !images.is_empty() && images.iter().all(|image| state.node(node).images.contains(image))
}

/// Score of the state with a new replica of `fu` on `node`.
fn score_with(state: &mut PlacementState, objective: &Objective, fu: usize, node: usize, role: ReplicaRole) -> f64 {
    state.add_replica(fu, node, role);
    let score = objective.score(state);
    state.remove_replica(fu, node);
    score
}

/// Feasible node with the best score for a new replica, or the violations
/// that ruled out every node.
pub fn best_target(
    state: &mut PlacementState,
    objective: &Objective,
    fu: usize,
    role: ReplicaRole,
    budget: &mut SearchBudget,
) -> Result<usize, BTreeMap<&'static str, usize>> {
    let mut reasons = BTreeMap::new();
    let mut best: Option<((bool, f64), usize)> = None;
    for node in 0..state.node_count() {
        if !budget.spend() {
            break;
        }
        if let Err(violation) = check_placement(state, fu, node, Placement::New(role), true) {
            *reasons.entry(violation.as_str()).or_insert(0) += 1;
            continue;
        }
        let key = (!prefers_node(state, fu, node), score_with(state, objective, fu, node, role));
        if best.as_ref().is_none_or(|(k, _)| key < *k) {
            best = Some((key, node));
        }
    }
    best.map(|(_, node)| node).ok_or(reasons)
}

/// Replica whose removal leaves the best score. Stateful units never drop
/// their primary here.
fn best_drop(state: &mut PlacementState, objective: &Objective, fu: usize) -> Option<usize> {
    let candidates: Vec<usize> = state
        .replicas(fu)
        .iter()
        .filter(|r| r.role == ReplicaRole::Secondary)
        .map(|r| r.node)
        .collect();
    let mut best: Option<(f64, usize)> = None;
    for node in candidates {
        let replica = state.remove_replica(fu, node);
        let score = objective.score(state);
        state.restore_replica(fu, replica);
        if best.is_none_or(|(s, _)| score < s) {
            best = Some((score, node));
        }
    }
    best.map(|(_, node)| node)
}

/// Relocate one replica of another unit so that a new replica of `fu`
/// fits. Only nodes ruled out purely for capacity are considered.
fn make_room(
    state: &mut PlacementState,
    objective: &Objective,
    fu: usize,
    role: ReplicaRole,
    budget: &mut SearchBudget,
) -> bool {
    let mut best: Option<(f64, usize, usize, usize)> = None;
    for node in 0..state.node_count() {
        if !matches!(
            check_placement(state, fu, node, Placement::New(role), true),
            Err(Violation::Capacity { .. })
        ) {
            continue;
        }
        let residents: Vec<usize> = (0..state.failover_unit_count())
            .filter(|other| *other != fu && !state.fu(*other).is_in_transition)
            .filter(|other| state.replica_on(*other, node).is_some_and(|r| !r.in_build))
            .collect();
        for other in residents {
            for dest in 0..state.node_count() {
                if !budget.spend() {
                    return apply_room(state, fu, role, best);
                }
                if check_placement(state, other, dest, Placement::Move { from: node }, true).is_err() {
                    continue;
                }
                let original = state.remove_replica(other, node);
                state.add_replica(other, dest, original.role);
                let fits = check_placement(state, fu, node, Placement::New(role), true).is_ok();
                let score = fits.then(|| score_with(state, objective, fu, node, role));
                state.remove_replica(other, dest);
                state.restore_replica(other, original);
                if let Some(score) = score
                    && best.is_none_or(|(s, ..)| score < s)
                {
                    best = Some((score, other, node, dest));
                }
            }
        }
    }
    apply_room(state, fu, role, best)
}

fn apply_room(
    state: &mut PlacementState,
    fu: usize,
    role: ReplicaRole,
    best: Option<(f64, usize, usize, usize)>,
) -> bool {
    let Some((_, other, node, dest)) = best else {
        return false;
    };
    state.move_replica(other, node, dest);
    state.add_replica(fu, node, role);
    true
}

#[cfg(test)]
mod tests {
    use plb_core::PlbConfig;

    use super::*;
    use crate::state::tests::SnapshotBuilder;

    fn run(snapshot: &plb_model::DomainSnapshot, config: &PlbConfig, allow_move: bool) -> (PlacementOutcome, Vec<Vec<(usize, ReplicaRole)>>) {
        let mut state = PlacementState::new(snapshot, config);
        let objective = Objective::new(snapshot, config);
        let mut budget = SearchBudget::new(10_000);
        let outcome = place_new_replicas(&mut state, &objective, &mut budget, allow_move);
        let placement = (0..state.failover_unit_count())
            .map(|fu| state.replicas(fu).iter().map(|r| (r.node, r.role)).collect())
            .collect();
        (outcome, placement)
    }

    #[test]
    fn places_instance_on_least_loaded_node() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[("CPU", 1, 1)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[])
            .build();
        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(outcome.placed, 1);
        assert_eq!(placement[1], vec![(1, ReplicaRole::Secondary)]);
    }

    #[test]
    fn ties_go_to_lowest_node_and_first_replica_is_primary() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .node("N3", "fd:/3", &[])
            .service(1, true, 2, &[])
            .failover_unit(1, 1, &[])
            .build();
        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(outcome.placed, 2);
        assert_eq!(
            placement[0],
            vec![(0, ReplicaRole::Primary), (1, ReplicaRole::Secondary)]
        );
    }

    #[test]
    fn unplaced_replica_records_reasons() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[("CPU", 4)])
            .node("N2", "fd:/2", &[("CPU", 1)])
            .service(1, false, 3, &[("CPU", 2, 2)])
            .failover_unit(1, 1, &[])
            .build();
        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(placement[0], vec![(0, ReplicaRole::Secondary)]);
        assert_eq!(outcome.unplaced.len(), 1);
        let reasons = &outcome.unplaced[0].reasons;
        assert_eq!(reasons.get("ReplicaAlreadyOnNode"), Some(&1));
        assert_eq!(reasons.get("Capacity"), Some(&1));
    }

    #[test]
    fn extra_replicas_drop_secondaries_only() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .node("N3", "fd:/3", &[])
            .service(1, true, 1, &[("CPU", 3, 1)])
            .failover_unit(
                1,
                1,
                &[
                    ("N1", ReplicaRole::Secondary),
                    ("N2", ReplicaRole::Primary),
                    ("N3", ReplicaRole::Secondary),
                ],
            )
            .build();
        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(outcome.dropped, 2);
        assert_eq!(placement[0], vec![(1, ReplicaRole::Primary)]);
    }

    #[test]
    fn with_move_frees_capacity() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[("CPU", 2)])
            .node("N2", "fd:/2", &[("CPU", 2)])
            .service(1, false, 1, &[("CPU", 1, 1)])
            .service(2, false, 1, &[("CPU", 2, 2)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N2", ReplicaRole::Secondary)])
            .failover_unit(3, 2, &[])
            .build();
        let (outcome, _) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(outcome.unplaced.len(), 1);

        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), true);
        assert!(outcome.unplaced.is_empty());
        assert_eq!(outcome.relocated, 1);
        assert_eq!(placement[0], vec![(1, ReplicaRole::Secondary)]);
        assert_eq!(placement[2], vec![(0, ReplicaRole::Secondary)]);
    }

    #[test]
    fn on_every_node_fills_eligible_nodes() {
        let mut snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .node("N3", "fd:/3", &[])
            .service(1, false, -1, &[])
            .failover_unit(1, 1, &[("N2", ReplicaRole::Secondary)])
            .build();
        snapshot.nodes[2].is_up = false;
        let (outcome, placement) = run(&snapshot, &PlbConfig::default(), false);
        assert_eq!(outcome.placed, 1);
        assert_eq!(
            placement[0],
            vec![(0, ReplicaRole::Secondary), (1, ReplicaRole::Secondary)]
        );
    }
}
