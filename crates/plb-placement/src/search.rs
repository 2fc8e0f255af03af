//! One search run over a domain snapshot for a chosen scheduler action.

use std::collections::BTreeMap;

use tracing::debug;

use plb_core::{
    FailoverUnitId, FailoverUnitMovementTable, NodeId, PlbConfig, ReplicaRole, SchedulerActionKind,
};
use plb_model::DomainSnapshot;

use crate::SearchBudget;
use crate::analysis::{DomainAnalysis, analyze};
use crate::balancer::{BalanceParams, balance, move_quota};
use crate::constraints::Violation;
use crate::fixer::{fix_violations, relocate_requested};
use crate::movements::build_movements;
use crate::objective::Objective;
use crate::placer::place_new_replicas;
use crate::state::PlacementState;

#[derive(Debug, Clone, PartialEq)]
pub struct UnplacedReport {
    pub failover_unit_id: FailoverUnitId,
    pub service_name: String,
    pub role: ReplicaRole,
    /// Violation name to the number of nodes it ruled out.
    pub reasons: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViolationReport {
    pub failover_unit_id: FailoverUnitId,
    pub service_name: String,
    pub node_id: NodeId,
    pub violation: Violation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// The action that produced the movements. A placement run that had
    /// to relocate replicas reports `NewReplicaPlacementWithMove`.
    pub action: SchedulerActionKind,
    pub movements: FailoverUnitMovementTable,
    pub unplaced: Vec<UnplacedReport>,
    pub unfixed: Vec<ViolationReport>,
    pub initial_score: f64,
    pub final_score: f64,
    pub evaluations: u32,
}

/// Analyze a snapshot without searching.
pub fn analyze_snapshot(snapshot: &DomainSnapshot, config: &PlbConfig) -> DomainAnalysis {
    let state = PlacementState::new(snapshot, config);
    analyze(&state, &Objective::new(snapshot, config))
}

/// Run the search for `action` and return the resulting movements.
///
/// `move_limit` caps balancing moves, on top of the per-pass quota.
pub fn run_search(
    snapshot: &DomainSnapshot,
    config: &PlbConfig,
    action: SchedulerActionKind,
    move_limit: usize,
) -> SearchResult {
    let mut state = PlacementState::new(snapshot, config);
    let objective = Objective::new(snapshot, config);
    let initial_score = objective.score(&state);
    let mut result_action = action;
    let mut not_possible = Vec::new();
    let mut unplaced = Vec::new();
    let mut unfixed = Vec::new();

    let budget_limit = match action {
        SchedulerActionKind::Upgrade | SchedulerActionKind::ConstraintCheck => config.constraint_check_search_budget,
        SchedulerActionKind::NewReplicaPlacement | SchedulerActionKind::NewReplicaPlacementWithMove => {
            config.placement_search_budget
        }
        SchedulerActionKind::QuickLoadBalancing => config.quick_balancing_search_budget,
        SchedulerActionKind::LoadBalancing => config.balancing_search_budget,
        _ => 0,
    };
    let mut budget = SearchBudget::new(budget_limit);

    match action {
        SchedulerActionKind::Upgrade => {
            not_possible = relocate_requested(&mut state, &objective, &mut budget).not_possible;
        }
        SchedulerActionKind::ConstraintCheck => {
            let fixed = fix_violations(&mut state, &objective, &mut budget);
            not_possible = relocate_requested(&mut state, &objective, &mut budget).not_possible;
            unfixed = fixed
                .unfixed
                .iter()
                .map(|v| ViolationReport {
                    failover_unit_id: state.fu(v.fu).id,
                    service_name: state.service(v.fu).name.clone(),
                    node_id: state.node(v.node).id.clone(),
                    violation: v.violation.clone(),
                })
                .collect();
        }
        SchedulerActionKind::NewReplicaPlacement | SchedulerActionKind::NewReplicaPlacementWithMove => {
            let allow_move = config.move_existing_replica_for_placement;
            let outcome = place_new_replicas(&mut state, &objective, &mut budget, allow_move);
            if outcome.relocated > 0 {
                result_action = SchedulerActionKind::NewReplicaPlacementWithMove;
            }
            unplaced = outcome
                .unplaced
                .iter()
                .map(|u| UnplacedReport {
                    failover_unit_id: state.fu(u.fu).id,
                    service_name: state.service(u.fu).name.clone(),
                    role: u.role,
                    reasons: u.reasons.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                })
                .collect();
        }
        SchedulerActionKind::QuickLoadBalancing | SchedulerActionKind::LoadBalancing => {
            let sources = (action == SchedulerActionKind::QuickLoadBalancing)
                .then(|| objective.analyze(&state).overloaded_nodes);
            let params = BalanceParams {
                move_limit: move_quota(&state).min(move_limit),
                sources,
            };
            balance(&mut state, &objective, &params, &mut budget);
        }
        _ => {}
    }

    let movements = build_movements(&state, result_action, &not_possible);
    let final_score = objective.score(&state);
    debug!(
        domain = %snapshot.domain_id,
        action = %result_action,
        movements = movements.len(),
        evaluations = budget.used(),
        initial_score,
        final_score,
        "search finished"
    );
    SearchResult {
        action: result_action,
        movements,
        unplaced,
        unfixed,
        initial_score,
        final_score,
        evaluations: budget.used(),
    }
}
