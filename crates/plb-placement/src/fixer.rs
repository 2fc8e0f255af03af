//! Constraint violation repair and authority-requested relocation.

use std::collections::BTreeSet;

use tracing::debug;

use plb_core::ReplicaRole;

use crate::SearchBudget;
use crate::constraints::{ExistingViolation, Placement, check_placement, check_swap, find_violations};
use crate::objective::Objective;
use crate::state::PlacementState;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixOutcome {
    pub moved: usize,
    pub swapped: usize,
    pub dropped: usize,
    /// Replicas the authority asked to relocate that have nowhere to go,
    /// as (failover unit, node).
    pub not_possible: Vec<(usize, usize)>,
    /// Violations still present when the search stopped.
    pub unfixed: Vec<ExistingViolation>,
}

/// Best node to move the replica of `fu` on `from` to.
pub fn best_move_target(
    state: &mut PlacementState,
    objective: &Objective,
    fu: usize,
    from: usize,
    use_buffer: bool,
    budget: &mut SearchBudget,
) -> Option<usize> {
    let mut best: Option<(f64, usize)> = None;
    for node in 0..state.node_count() {
        if !budget.spend() {
            break;
        }
        if check_placement(state, fu, node, Placement::Move { from }, use_buffer).is_err() {
            continue;
        }
        let original = state.remove_replica(fu, from);
        state.add_replica(fu, node, original.role);
        let score = objective.score(state);
        state.remove_replica(fu, node);
        state.restore_replica(fu, original);
        if best.is_none_or(|(s, _)| score < s) {
            best = Some((score, node));
        }
    }
    best.map(|(_, node)| node)
}

/// Move replicas off nodes where they break a hard constraint.
///
/// Targets are checked without the node buffer. Instances of on-every-node
/// services are dropped instead of moved. Violations that cannot be fixed
/// are reported and left alone.
pub fn fix_violations(state: &mut PlacementState, objective: &Objective, budget: &mut SearchBudget) -> FixOutcome {
    let mut outcome = FixOutcome::default();
    let mut stuck: BTreeSet<(usize, usize)> = BTreeSet::new();
    while !budget.is_exhausted() {
        let Some(violation) = find_violations(state)
            .into_iter()
            .find(|v| !stuck.contains(&(v.fu, v.node)))
        else {
            break;
        };
        let (fu, node) = (violation.fu, violation.node);
        if state.service(fu).on_every_node {
            state.remove_replica(fu, node);
            outcome.dropped += 1;
            continue;
        }
        match best_move_target(state, objective, fu, node, false, budget) {
            Some(target) => {
                state.move_replica(fu, node, target);
                outcome.moved += 1;
            }
            None => {
                debug!(
                    failover_unit = %state.fu(fu).id,
                    node = %state.node(node).id,
                    violation = %violation.violation,
                    "constraint violation cannot be fixed"
                );
                stuck.insert((fu, node));
            }
        }
    }
    outcome.unfixed = find_violations(state);
    outcome
}

/// Whether the authority flagged any replica for a swap or a move.
pub fn has_requested_relocations(state: &PlacementState) -> bool {
    (0..state.failover_unit_count()).any(|fu| {
        !state.fu(fu).is_in_transition
            && state.replicas(fu).iter().any(|r| {
                (r.flags.primary_to_be_swapped_out && r.role == ReplicaRole::Primary) || r.flags.move_in_progress
            })
    })
}

/// Swap out flagged primaries and move replicas marked as moving.
///
/// A primary is swapped with the ready secondary that scores best,
/// preferring upgrade domains that already completed the upgrade when so
/// configured. Flagged replicas with no feasible destination are reported
/// as not possible.
pub fn relocate_requested(state: &mut PlacementState, objective: &Objective, budget: &mut SearchBudget) -> FixOutcome {
    let mut outcome = FixOutcome::default();
    for fu in 0..state.failover_unit_count() {
        if state.fu(fu).is_in_transition {
            continue;
        }
        let flagged: Vec<(usize, ReplicaRole, bool, bool)> = state
            .replicas(fu)
            .iter()
            .map(|r| (r.node, r.role, r.flags.primary_to_be_swapped_out, r.flags.move_in_progress))
            .filter(|(_, _, swap, moving)| *swap || *moving)
            .collect();

        for (node, role, swap_out, moving) in flagged {
            if swap_out && role == ReplicaRole::Primary {
                match best_swap(state, objective, fu, node, budget) {
                    Some(secondary) => {
                        state.swap_roles(fu, node, secondary);
                        outcome.swapped += 1;
                    }
                    None => outcome.not_possible.push((fu, node)),
                }
            } else if moving {
                match best_move_target(state, objective, fu, node, true, budget) {
                    Some(target) => {
                        state.move_replica(fu, node, target);
                        outcome.moved += 1;
                    }
                    None => outcome.not_possible.push((fu, node)),
                }
            }
        }
    }
    outcome
}

fn best_swap(
    state: &mut PlacementState,
    objective: &Objective,
    fu: usize,
    primary: usize,
    budget: &mut SearchBudget,
) -> Option<usize> {
    let app = state.service(fu).application;
    let prefer_upgraded = state.config.prefer_upgraded_upgrade_domains;
    let secondaries: Vec<usize> = state
        .replicas(fu)
        .iter()
        .filter(|r| r.role == ReplicaRole::Secondary)
        .map(|r| r.node)
        .collect();

    let mut best: Option<((bool, f64), usize)> = None;
    for secondary in secondaries {
        if !budget.spend() {
            break;
        }
        if check_swap(state, fu, primary, secondary).is_err() {
            continue;
        }
        let upgraded = state
            .snapshot
            .is_upgrade_domain_completed(&state.node(secondary).upgrade_domain, app);
        state.swap_roles(fu, primary, secondary);
        let score = objective.score(state);
        state.swap_roles(fu, secondary, primary);
        let key = (prefer_upgraded && !upgraded, score);
        if best.as_ref().is_none_or(|(k, _)| key < *k) {
            best = Some((key, secondary));
        }
    }
    best.map(|(_, node)| node)
}

#[cfg(test)]
mod tests {
    use plb_core::{DeactivationIntent, PlbConfig};

    use super::*;
    use crate::state::tests::SnapshotBuilder;

    #[test]
    fn moves_replica_off_blocked_node() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[])
            .with_service(1, |s| {
                s.blocked_nodes.insert("N1".into());
            })
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let outcome = fix_violations(&mut state, &objective, &mut SearchBudget::new(100));
        assert_eq!(outcome.moved, 1);
        assert!(outcome.unfixed.is_empty());
        assert_eq!(state.replicas(0)[0].node, 1);
    }

    #[test]
    fn unfixable_violation_is_reported() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .service(1, false, 1, &[])
            .with_service(1, |s| s.placement_constraints = "NodeType == Gpu".into())
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let outcome = fix_violations(&mut state, &objective, &mut SearchBudget::new(100));
        assert_eq!(outcome.moved, 0);
        assert_eq!(outcome.unfixed.len(), 1);
        assert_eq!(state.replicas(0)[0].node, 0);
    }

    #[test]
    fn swaps_out_primary_preferring_upgraded_domain() {
        let mut snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .node("N3", "fd:/3", &[])
            .service(1, true, 3, &[])
            .failover_unit(
                1,
                1,
                &[
                    ("N1", ReplicaRole::Primary),
                    ("N2", ReplicaRole::Secondary),
                    ("N3", ReplicaRole::Secondary),
                ],
            )
            .with_failover_unit(1, |fu| fu.replicas[0].flags.primary_to_be_swapped_out = true)
            .build();
        snapshot.cluster_upgrade_in_progress = true;
        snapshot.completed_upgrade_domains.insert("UD-N3".into());
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        assert!(has_requested_relocations(&state));

        let outcome = relocate_requested(&mut state, &objective, &mut SearchBudget::new(100));
        assert_eq!(outcome.swapped, 1);
        assert_eq!(state.primary(0).map(|r| r.node), Some(2));
    }

    #[test]
    fn requested_move_without_destination_is_not_possible() {
        let mut snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, true, 2, &[])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Primary), ("N2", ReplicaRole::Secondary)])
            .with_failover_unit(1, |fu| fu.replicas[1].flags.move_in_progress = true)
            .build();
        snapshot.nodes[0].deactivation = Some(DeactivationIntent::Pause);
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let outcome = relocate_requested(&mut state, &objective, &mut SearchBudget::new(100));
        assert_eq!(outcome.not_possible, vec![(0, 1)]);
    }
}
