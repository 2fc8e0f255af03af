//! Load balancing by best-improvement hill climbing.
//!
//! Each step evaluates every single-replica move and every primary/secondary
//! swap that keeps all hard constraints satisfied (node buffer included),
//! then applies the one that lowers the score the most once its move cost
//! is charged. The search stops when no candidate improves the score by
//! more than the configured threshold, when the move quota is used up, or
//! when the evaluation budget runs out. Candidates are generated in
//! (failover unit, source, target) order, so ties resolve deterministically.

use std::collections::BTreeSet;

use tracing::trace;

use plb_core::ReplicaRole;

use crate::SearchBudget;
use crate::constraints::{Placement, check_placement, check_swap};
use crate::objective::Objective;
use crate::state::PlacementState;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    Move { fu: usize, from: usize, to: usize },
    Swap { fu: usize, primary: usize, secondary: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceOutcome {
    pub moves: usize,
    pub swaps: usize,
    pub initial_score: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone)]
pub struct BalanceParams {
    /// Maximum moves and swaps this pass may make.
    pub move_limit: usize,
    /// Restrict sources to these nodes (quick balancing).
    pub sources: Option<BTreeSet<usize>>,
}

/// Moves allowed in one balancing pass: a share of the domain's replicas,
/// at least one.
pub fn move_quota(state: &PlacementState) -> usize {
    let share = state.config.max_percentage_to_move * state.total_replicas() as f64;
    (share.ceil() as usize).max(1)
}

pub fn balance(
    state: &mut PlacementState,
    objective: &Objective,
    params: &BalanceParams,
    budget: &mut SearchBudget,
) -> BalanceOutcome {
    let initial = objective.score(state);
    let mut outcome = BalanceOutcome {
        initial_score: initial,
        final_score: initial,
        ..Default::default()
    };
    let threshold = state.config.score_improvement_threshold;

    while outcome.moves + outcome.swaps < params.move_limit && !budget.is_exhausted() {
        let current = objective.score(state);
        let Some((score, step)) = best_step(state, objective, params, budget) else {
            break;
        };
        if score >= current - threshold {
            break;
        }
        trace!(?step, current, score, "balancing step");
        match step {
            Step::Move { fu, from, to } => {
                state.move_replica(fu, from, to);
                outcome.moves += 1;
            }
            Step::Swap { fu, primary, secondary } => {
                state.swap_roles(fu, primary, secondary);
                outcome.swaps += 1;
            }
        }
    }
    outcome.final_score = objective.score(state);
    outcome
}

fn movable(state: &PlacementState, fu: usize) -> bool {
    let view = state.fu(fu);
    !view.is_in_transition
        && !state.service(fu).on_every_node
        && !state
            .replicas(fu)
            .iter()
            .any(|r| r.flags.move_in_progress || r.flags.primary_to_be_swapped_out)
}

fn best_step(
    state: &mut PlacementState,
    objective: &Objective,
    params: &BalanceParams,
    budget: &mut SearchBudget,
) -> Option<(f64, Step)> {
    let is_source = |node: usize| params.sources.as_ref().is_none_or(|s| s.contains(&node));
    let swap_penalty = objective.swap_penalty();
    let mut best: Option<(f64, Step)> = None;
    let consider = |score: f64, step: Step, best: &mut Option<(f64, Step)>| {
        if best.as_ref().is_none_or(|(s, _)| score < *s) {
            *best = Some((score, step));
        }
    };

    for fu in 0..state.failover_unit_count() {
        if !movable(state, fu) {
            continue;
        }
        let replicas: Vec<(usize, ReplicaRole, bool)> = state
            .replicas(fu)
            .iter()
            .map(|r| (r.node, r.role, r.in_build))
            .collect();

        for &(from, role, in_build) in &replicas {
            if in_build || !is_source(from) {
                continue;
            }
            let cost = state.fu(fu).move_cost(state.service(fu), role);
            let penalty = objective.move_penalty(state.config, cost);
            for to in 0..state.node_count() {
                if !budget.spend() {
                    return best;
                }
                if check_placement(state, fu, to, Placement::Move { from }, true).is_err() {
                    continue;
                }
                let original = state.remove_replica(fu, from);
                state.add_replica(fu, to, role);
                let score = objective.score(state) + penalty;
                state.remove_replica(fu, to);
                state.restore_replica(fu, original);
                consider(score, Step::Move { fu, from, to }, &mut best);
            }
        }

        let Some(primary) = replicas.iter().find(|r| r.1 == ReplicaRole::Primary).map(|r| r.0) else {
            continue;
        };
        for &(secondary, role, _) in &replicas {
            if role != ReplicaRole::Secondary || !(is_source(primary) || is_source(secondary)) {
                continue;
            }
            if !budget.spend() {
                return best;
            }
            if check_swap(state, fu, primary, secondary).is_err() {
                continue;
            }
            state.swap_roles(fu, primary, secondary);
            let score = objective.score(state) + swap_penalty;
            state.swap_roles(fu, secondary, primary);
            consider(score, Step::Swap { fu, primary, secondary }, &mut best);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use plb_core::PlbConfig;

    use super::*;
    use crate::state::tests::SnapshotBuilder;

    fn params(state: &PlacementState) -> BalanceParams {
        BalanceParams {
            move_limit: move_quota(state),
            sources: None,
        }
    }

    #[test]
    fn spreads_load_across_nodes() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[("CPU", 10, 10)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(3, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(4, 1, &[("N1", ReplicaRole::Secondary)])
            .build();
        let mut config = PlbConfig::default();
        config.max_percentage_to_move = 1.0;
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let params = params(&state);
        let outcome = balance(&mut state, &objective, &params, &mut SearchBudget::new(10_000));

        assert_eq!(outcome.moves, 2);
        assert!(outcome.final_score < outcome.initial_score);
        assert_eq!(state.node_load(0, "CPU"), 20);
        assert_eq!(state.node_load(1, "CPU"), 20);
        // Lowest failover units move first.
        assert_eq!(state.replicas(0)[0].node, 1);
        assert_eq!(state.replicas(1)[0].node, 1);
    }

    #[test]
    fn quota_limits_moves() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[("CPU", 10, 10)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(3, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(4, 1, &[("N1", ReplicaRole::Secondary)])
            .build();
        let mut config = PlbConfig::default();
        config.max_percentage_to_move = 0.1;
        let mut state = PlacementState::new(&snapshot, &config);
        assert_eq!(move_quota(&state), 1);
        let objective = Objective::new(&snapshot, &config);
        let params = params(&state);
        let outcome = balance(&mut state, &objective, &params, &mut SearchBudget::new(10_000));
        assert_eq!(outcome.moves, 1);
    }

    #[test]
    fn swaps_primary_instead_of_moving() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, true, 2, &[("CPU", 10, 1)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Primary), ("N2", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N1", ReplicaRole::Primary), ("N2", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let params = params(&state);
        let outcome = balance(&mut state, &objective, &params, &mut SearchBudget::new(10_000));
        assert_eq!(outcome.swaps, 1);
        assert_eq!(outcome.moves, 0);
        assert_eq!(state.primary(0).map(|r| r.node), Some(1));
        assert_eq!(state.primary(1).map(|r| r.node), Some(0));
    }

    #[test]
    fn balanced_domain_stays_put() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[("CPU", 5, 5)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N2", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let params = params(&state);
        let outcome = balance(&mut state, &objective, &params, &mut SearchBudget::new(10_000));
        assert_eq!(outcome, BalanceOutcome { initial_score: 0.0, final_score: 0.0, ..Default::default() });
    }
}
