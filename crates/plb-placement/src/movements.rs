//! Turn a searched placement into movements for the failover authority.
//!
//! For each failover unit the healthy replicas of the snapshot are diffed
//! against the working placement. Primary changes are expressed first (as
//! a swap, a promotion, a primary move, an add or a drop); removed and
//! added secondaries are then paired in ascending node order into moves,
//! and whatever remains becomes adds or drops.

use std::collections::BTreeMap;

use plb_core::{
    ActionKind, FailoverUnitId, FailoverUnitMovement, FailoverUnitMovementTable, PlbAction, PlbConfig,
    ReplicaRole, SchedulerActionKind,
};
use plb_model::DomainSnapshot;

use crate::constraints::{Violation, check_existing};
use crate::state::PlacementState;

fn initial_replicas(state: &PlacementState, fu: usize) -> BTreeMap<usize, ReplicaRole> {
    state
        .fu(fu)
        .healthy_replicas()
        .filter_map(|r| state.node_index(&r.node_id).map(|n| (n, r.role)))
        .collect()
}

fn final_replicas(state: &PlacementState, fu: usize) -> BTreeMap<usize, ReplicaRole> {
    state.replicas(fu).iter().map(|r| (r.node, r.role)).collect()
}

/// Actions that take the unit from `initial` to `target`.
fn diff(
    is_stateful: bool,
    initial: &BTreeMap<usize, ReplicaRole>,
    target: &BTreeMap<usize, ReplicaRole>,
) -> Vec<(ActionKind, Option<usize>, Option<usize>)> {
    let mut actions = Vec::new();
    let mut current = initial.clone();
    let primary_of = |m: &BTreeMap<usize, ReplicaRole>| {
        m.iter().find(|(_, r)| **r == ReplicaRole::Primary).map(|(n, _)| *n)
    };

    if is_stateful {
        let before = primary_of(&current);
        let after = primary_of(target);
        match (before, after) {
            (before, after) if before == after => {}
            (Some(old), Some(new)) if current.contains_key(&new) => {
                actions.push((ActionKind::SwapPrimarySecondary, Some(old), Some(new)));
                current.insert(old, ReplicaRole::Secondary);
                current.insert(new, ReplicaRole::Primary);
            }
            (None, Some(new)) if current.contains_key(&new) => {
                actions.push((ActionKind::PromoteSecondary, None, Some(new)));
                current.insert(new, ReplicaRole::Primary);
            }
            (Some(old), Some(new)) => {
                actions.push((ActionKind::MovePrimary, Some(old), Some(new)));
                current.remove(&old);
                current.insert(new, ReplicaRole::Primary);
            }
            (None, Some(new)) => {
                actions.push((ActionKind::AddPrimary, None, Some(new)));
                current.insert(new, ReplicaRole::Primary);
            }
            (Some(old), None) => {
                if !target.contains_key(&old) {
                    actions.push((ActionKind::DropPrimary, Some(old), None));
                    current.remove(&old);
                }
            }
            (None, None) => {}
        }
    }

    let (add, mv, drop_kind) = if is_stateful {
        (ActionKind::AddSecondary, ActionKind::MoveSecondary, ActionKind::DropSecondary)
    } else {
        (ActionKind::AddInstance, ActionKind::MoveInstance, ActionKind::DropInstance)
    };
    let removed: Vec<usize> = current.keys().filter(|n| !target.contains_key(n)).copied().collect();
    let added: Vec<usize> = target.keys().filter(|n| !current.contains_key(n)).copied().collect();
    for (from, to) in removed.iter().zip(&added) {
        actions.push((mv, Some(*from), Some(*to)));
    }
    for to in added.iter().skip(removed.len()) {
        actions.push((add, None, Some(*to)));
    }
    for from in removed.iter().skip(added.len()) {
        let kind = if current.get(from) == Some(&ReplicaRole::Primary) {
            ActionKind::DropPrimary
        } else {
            drop_kind
        };
        actions.push((kind, Some(*from), None));
    }
    actions
}

/// Movements for every failover unit whose placement changed, plus a
/// `RequestedPlacementNotPossible` action for each (unit, node) in
/// `not_possible`.
pub fn build_movements(
    state: &PlacementState,
    scheduler_action: SchedulerActionKind,
    not_possible: &[(usize, usize)],
) -> FailoverUnitMovementTable {
    let mut table = FailoverUnitMovementTable::new();
    for fu in 0..state.failover_unit_count() {
        let service = state.service(fu);
        let mut steps = diff(service.is_stateful, &initial_replicas(state, fu), &final_replicas(state, fu));
        steps.extend(
            not_possible
                .iter()
                .filter(|(f, _)| *f == fu)
                .map(|(_, node)| (ActionKind::RequestedPlacementNotPossible, Some(*node), None)),
        );
        if steps.is_empty() {
            continue;
        }
        let node_id = |idx: Option<usize>| idx.map(|n| state.node(n).id.clone());
        let view = state.fu(fu);
        table.insert(
            view.id,
            FailoverUnitMovement {
                failover_unit_id: view.id,
                service_name: service.name.clone(),
                is_stateful: service.is_stateful,
                version: view.version,
                is_in_transition: view.is_in_transition,
                actions: steps
                    .into_iter()
                    .map(|(kind, from, to)| PlbAction::new(kind, node_id(from), node_id(to), scheduler_action))
                    .collect(),
            },
        );
    }
    table
}

/// Re-check a movement table against the snapshot it was computed from.
///
/// Every action is applied to a fresh working placement; each replica an
/// action lands on a target node must then satisfy the hard constraints.
/// A failed movement is taken out and the rest is checked again without
/// its effects, until no new failure shows up. Returns the first violation
/// per failover unit.
pub fn verify_movements(
    snapshot: &DomainSnapshot,
    config: &PlbConfig,
    table: &FailoverUnitMovementTable,
) -> BTreeMap<FailoverUnitId, Violation> {
    let mut failed = BTreeMap::new();
    loop {
        let round = verify_round(snapshot, config, table, &failed);
        if round.is_empty() {
            return failed;
        }
        failed.extend(round);
    }
}

fn verify_round(
    snapshot: &DomainSnapshot,
    config: &PlbConfig,
    table: &FailoverUnitMovementTable,
    excluded: &BTreeMap<FailoverUnitId, Violation>,
) -> BTreeMap<FailoverUnitId, Violation> {
    let mut state = PlacementState::new(snapshot, config);
    let mut failed = BTreeMap::new();
    let mut targets = Vec::new();

    for movement in table.values() {
        if excluded.contains_key(&movement.failover_unit_id) {
            continue;
        }
        let Some(fu) = state.failover_unit_index(&movement.failover_unit_id) else {
            continue;
        };
        for action in &movement.actions {
            let from = action.source_node.as_deref().and_then(|n| state.node_index(n));
            let to = action.target_node.as_deref().and_then(|n| state.node_index(n));
            if let Err(violation) = apply(&mut state, fu, action.kind, from, to) {
                failed.entry(movement.failover_unit_id).or_insert(violation);
                break;
            }
            if let Some(to) = to {
                targets.push((movement.failover_unit_id, fu, to, action.kind.is_add()));
            }
        }
    }
    // Partially applied movements leave their effects behind; the next
    // round runs without them.
    if !failed.is_empty() {
        return failed;
    }

    for (id, fu, node, is_add) in targets {
        if failed.contains_key(&id) {
            continue;
        }
        let view = state.node(node);
        let result = if !view.is_up {
            Err(Violation::NodeDown)
        } else if view.deactivation.is_some() {
            Err(Violation::NodeDeactivating)
        } else if is_add && !state.service(fu).service_type_known {
            Err(Violation::UnknownServiceType)
        } else {
            check_existing(&state, fu, node)
        };
        if let Err(violation) = result {
            failed.insert(id, violation);
        }
    }
    failed
}

fn apply(
    state: &mut PlacementState,
    fu: usize,
    kind: ActionKind,
    from: Option<usize>,
    to: Option<usize>,
) -> Result<(), Violation> {
    let hosted = |state: &PlacementState, node: Option<usize>| node.filter(|n| state.hosts(fu, *n));
    match kind {
        ActionKind::AddPrimary | ActionKind::AddSecondary | ActionKind::AddInstance => {
            let to = to.ok_or(Violation::ReplicaNotReady)?;
            if state.hosts(fu, to) {
                return Err(Violation::ReplicaAlreadyOnNode);
            }
            let role = if kind == ActionKind::AddPrimary {
                ReplicaRole::Primary
            } else {
                ReplicaRole::Secondary
            };
            state.add_replica(fu, to, role);
        }
        ActionKind::MovePrimary | ActionKind::MoveSecondary | ActionKind::MoveInstance => {
            let from = hosted(state, from).ok_or(Violation::ReplicaNotReady)?;
            let to = to.ok_or(Violation::ReplicaNotReady)?;
            if state.hosts(fu, to) {
                return Err(Violation::ReplicaAlreadyOnNode);
            }
            state.move_replica(fu, from, to);
        }
        ActionKind::SwapPrimarySecondary => {
            let primary = hosted(state, from).ok_or(Violation::ReplicaNotReady)?;
            let secondary = hosted(state, to).ok_or(Violation::ReplicaNotReady)?;
            if state.replica_on(fu, primary).map(|r| r.role) != Some(ReplicaRole::Primary) {
                return Err(Violation::ReplicaNotReady);
            }
            state.swap_roles(fu, primary, secondary);
        }
        ActionKind::PromoteSecondary => {
            let node = hosted(state, to).ok_or(Violation::ReplicaNotReady)?;
            let mut replica = state.remove_replica(fu, node);
            replica.role = ReplicaRole::Primary;
            state.restore_replica(fu, replica);
        }
        ActionKind::DropPrimary | ActionKind::DropSecondary | ActionKind::DropInstance => {
            if let Some(from) = hosted(state, from) {
                state.remove_replica(fu, from);
            }
        }
        ActionKind::RequestedPlacementNotPossible => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use plb_core::ReplicaRole::{Primary as P, Secondary as S};

    use super::*;

    fn roles(entries: &[(usize, ReplicaRole)]) -> BTreeMap<usize, ReplicaRole> {
        entries.iter().copied().collect()
    }

    #[test]
    fn swap_then_move_secondary() {
        let actions = diff(true, &roles(&[(0, P), (1, S)]), &roles(&[(1, P), (2, S)]));
        assert_eq!(
            actions,
            vec![
                (ActionKind::SwapPrimarySecondary, Some(0), Some(1)),
                (ActionKind::MoveSecondary, Some(0), Some(2)),
            ]
        );
    }

    #[test]
    fn primary_move_and_add() {
        let actions = diff(true, &roles(&[(0, P)]), &roles(&[(1, P), (2, S)]));
        assert_eq!(
            actions,
            vec![
                (ActionKind::MovePrimary, Some(0), Some(1)),
                (ActionKind::AddSecondary, None, Some(2)),
            ]
        );
    }

    #[test]
    fn promote_and_add_primary() {
        let promoted = diff(true, &roles(&[(1, S)]), &roles(&[(1, P)]));
        assert_eq!(promoted, vec![(ActionKind::PromoteSecondary, None, Some(1))]);

        let added = diff(true, &roles(&[]), &roles(&[(0, P), (1, S)]));
        assert_eq!(
            added,
            vec![
                (ActionKind::AddPrimary, None, Some(0)),
                (ActionKind::AddSecondary, None, Some(1)),
            ]
        );
    }

    #[test]
    fn stateless_uses_instance_actions() {
        let actions = diff(false, &roles(&[(0, S), (1, S), (2, S)]), &roles(&[(1, S), (3, S)]));
        assert_eq!(
            actions,
            vec![
                (ActionKind::MoveInstance, Some(0), Some(3)),
                (ActionKind::DropInstance, Some(2), None),
            ]
        );
    }

    #[test]
    fn verify_accepts_search_output_and_rejects_overload() {
        use crate::state::tests::SnapshotBuilder;

        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[("CPU", 10)])
            .node("N2", "fd:/2", &[("CPU", 10)])
            .service(1, false, 1, &[("CPU", 6, 6)])
            .failover_unit(1, 1, &[("N1", S)])
            .failover_unit(2, 1, &[])
            .build();
        let config = PlbConfig::default();
        let state = PlacementState::new(&snapshot, &config);
        let fu1 = state.fu(0).id;
        let fu2 = state.fu(1).id;
        let movement = |id, kind, from: Option<&str>, to: Option<&str>| FailoverUnitMovement {
            failover_unit_id: id,
            service_name: "svc".into(),
            is_stateful: false,
            version: 1,
            is_in_transition: false,
            actions: vec![PlbAction::new(
                kind,
                from.map(str::to_string),
                to.map(str::to_string),
                SchedulerActionKind::NewReplicaPlacement,
            )],
        };

        let mut table = FailoverUnitMovementTable::new();
        table.insert(fu2, movement(fu2, ActionKind::AddInstance, None, Some("N2")));
        assert!(verify_movements(&snapshot, &config, &table).is_empty());

        table.insert(fu2, movement(fu2, ActionKind::AddInstance, None, Some("N1")));
        let failed = verify_movements(&snapshot, &config, &table);
        assert!(matches!(failed.get(&fu2), Some(Violation::Capacity { .. })));

        let mut moved = FailoverUnitMovementTable::new();
        moved.insert(fu1, movement(fu1, ActionKind::MoveInstance, Some("N2"), Some("N1")));
        assert_eq!(
            verify_movements(&snapshot, &config, &moved).get(&fu1),
            Some(&Violation::ReplicaNotReady)
        );
    }

    #[test]
    fn failed_movement_does_not_weigh_on_the_rest() {
        use crate::state::tests::SnapshotBuilder;

        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[("CPU", 10)])
            .node("N2", "fd:/2", &[("CPU", 10)])
            .service(1, false, 1, &[("CPU", 6, 6)])
            .failover_unit(1, 1, &[("N1", S)])
            .failover_unit(2, 1, &[])
            .failover_unit(3, 1, &[])
            .build();
        let config = PlbConfig::default();
        let state = PlacementState::new(&snapshot, &config);
        let fu2 = state.fu(1).id;
        let fu3 = state.fu(2).id;
        let action = |kind, from: Option<&str>, to: Option<&str>| {
            PlbAction::new(
                kind,
                from.map(str::to_string),
                to.map(str::to_string),
                SchedulerActionKind::NewReplicaPlacement,
            )
        };
        let movement = |id, actions| FailoverUnitMovement {
            failover_unit_id: id,
            service_name: "svc".into(),
            is_stateful: false,
            version: 1,
            is_in_transition: false,
            actions,
        };

        // The add to N2 applies, then the move from N1 fails: fu2 holds
        // nothing there. Its half-applied add must not crowd out fu3.
        let mut table = FailoverUnitMovementTable::new();
        table.insert(
            fu2,
            movement(
                fu2,
                vec![
                    action(ActionKind::AddInstance, None, Some("N2")),
                    action(ActionKind::MoveInstance, Some("N1"), Some("N2")),
                ],
            ),
        );
        table.insert(fu3, movement(fu3, vec![action(ActionKind::AddInstance, None, Some("N2"))]));

        let failed = verify_movements(&snapshot, &config, &table);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed.get(&fu2), Some(&Violation::ReplicaNotReady));
        assert!(!failed.contains_key(&fu3));
    }

    #[test]
    fn unchanged_unit_has_no_actions() {
        assert!(diff(true, &roles(&[(0, P), (1, S)]), &roles(&[(0, P), (1, S)])).is_empty());
    }
}
