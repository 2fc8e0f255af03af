//! What a domain needs, as seen by the scheduler action selector.

use plb_core::ReplicaRole;

use crate::constraints::{Placement, check_placement, find_violations};
use crate::fixer::has_requested_relocations;
use crate::objective::{BalanceAnalysis, Objective};
use crate::state::PlacementState;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainAnalysis {
    pub upgrade_in_progress: bool,
    /// Replicas flagged by the authority for a swap or a move.
    pub requested_relocations: bool,
    pub violations: usize,
    pub missing_replicas: usize,
    pub extra_replicas: usize,
    pub balance: BalanceAnalysis,
}

impl DomainAnalysis {
    pub fn needs_placement(&self) -> bool {
        self.missing_replicas > 0 || self.extra_replicas > 0
    }
}

pub fn analyze(state: &PlacementState, objective: &Objective) -> DomainAnalysis {
    let mut analysis = DomainAnalysis {
        upgrade_in_progress: state.snapshot.upgrade_in_progress(),
        requested_relocations: has_requested_relocations(state),
        violations: find_violations(state).len(),
        balance: objective.analyze(state),
        ..Default::default()
    };
    for fu in 0..state.failover_unit_count() {
        if state.fu(fu).is_in_transition {
            continue;
        }
        let have = state.replicas(fu).len();
        match state.fu(fu).target(state.service(fu)) {
            Some(target) => {
                let target = target as usize;
                analysis.missing_replicas += target.saturating_sub(have);
                analysis.extra_replicas += have.saturating_sub(target);
            }
            None => {
                analysis.missing_replicas += (0..state.node_count())
                    .filter(|n| !state.hosts(fu, *n) && state.is_node_eligible(*n))
                    .filter(|n| check_placement(state, fu, *n, Placement::New(ReplicaRole::Secondary), true).is_ok())
                    .count();
            }
        }
    }
    analysis
}

#[cfg(test)]
mod tests {
    use plb_core::PlbConfig;

    use super::*;
    use crate::state::tests::SnapshotBuilder;

    #[test]
    fn counts_missing_and_extra_replicas() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, true, 2, &[])
            .service(2, false, 1, &[])
            .service(3, false, -1, &[])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Primary)])
            .failover_unit(2, 2, &[("N1", ReplicaRole::Secondary), ("N2", ReplicaRole::Secondary)])
            .failover_unit(3, 3, &[("N2", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let state = PlacementState::new(&snapshot, &config);
        let analysis = analyze(&state, &Objective::new(&snapshot, &config));
        // One secondary for unit 1, one instance on N1 for unit 3.
        assert_eq!(analysis.missing_replicas, 2);
        assert_eq!(analysis.extra_replicas, 1);
        assert_eq!(analysis.violations, 0);
        assert!(analysis.needs_placement());
        assert!(!analysis.requested_relocations);
    }
}
