//! Movement vocabulary exchanged with the failover authority.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{FailoverUnitId, NodeId};

/// Identifies one refresh decision; every emitted or dropped movement
/// carries the id of the decision that produced it.
pub type DecisionId = Uuid;

/// The kind of a single replica action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    AddPrimary,
    AddSecondary,
    AddInstance,
    MoveSecondary,
    MoveInstance,
    MovePrimary,
    SwapPrimarySecondary,
    PromoteSecondary,
    RequestedPlacementNotPossible,
    DropPrimary,
    DropSecondary,
    DropInstance,
}

impl ActionKind {
    pub fn is_add(self) -> bool {
        matches!(
            self,
            ActionKind::AddPrimary | ActionKind::AddSecondary | ActionKind::AddInstance
        )
    }

    pub fn is_move(self) -> bool {
        matches!(
            self,
            ActionKind::MovePrimary | ActionKind::MoveSecondary | ActionKind::MoveInstance
        )
    }

    pub fn is_drop(self) -> bool {
        matches!(
            self,
            ActionKind::DropPrimary | ActionKind::DropSecondary | ActionKind::DropInstance
        )
    }

    pub fn has_source_node(self) -> bool {
        match self {
            ActionKind::AddPrimary
            | ActionKind::AddSecondary
            | ActionKind::AddInstance
            | ActionKind::PromoteSecondary => false,
            ActionKind::MovePrimary
            | ActionKind::MoveSecondary
            | ActionKind::MoveInstance
            | ActionKind::SwapPrimarySecondary
            | ActionKind::DropPrimary
            | ActionKind::DropSecondary
            | ActionKind::DropInstance
            | ActionKind::RequestedPlacementNotPossible => true,
        }
    }

    pub fn has_target_node(self) -> bool {
        match self {
            ActionKind::AddPrimary
            | ActionKind::AddSecondary
            | ActionKind::AddInstance
            | ActionKind::MovePrimary
            | ActionKind::MoveSecondary
            | ActionKind::MoveInstance
            | ActionKind::SwapPrimarySecondary
            | ActionKind::PromoteSecondary => true,
            ActionKind::DropPrimary
            | ActionKind::DropSecondary
            | ActionKind::DropInstance
            | ActionKind::RequestedPlacementNotPossible => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::AddPrimary => "AddPrimary",
            ActionKind::AddSecondary => "AddSecondary",
            ActionKind::AddInstance => "AddInstance",
            ActionKind::MoveSecondary => "MoveSecondary",
            ActionKind::MoveInstance => "MoveInstance",
            ActionKind::MovePrimary => "MovePrimary",
            ActionKind::SwapPrimarySecondary => "SwapPrimarySecondary",
            ActionKind::PromoteSecondary => "PromoteSecondary",
            ActionKind::RequestedPlacementNotPossible => "RequestedPlacementNotPossible",
            ActionKind::DropPrimary => "DropPrimary",
            ActionKind::DropSecondary => "DropSecondary",
            ActionKind::DropInstance => "DropInstance",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scheduler action a domain was in when a movement was computed.
///
/// Declared in priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchedulerActionKind {
    Upgrade,
    ConstraintCheck,
    NewReplicaPlacementWithMove,
    NewReplicaPlacement,
    QuickLoadBalancing,
    LoadBalancing,
    ClientApiPromoteToPrimary,
    ClientApiMovePrimary,
    ClientApiMoveSecondary,
    NoActionNeeded,
    /// Received from a peer running a newer vocabulary.
    Unknown,
}

impl SchedulerActionKind {
    pub fn is_balancing(self) -> bool {
        matches!(
            self,
            SchedulerActionKind::QuickLoadBalancing | SchedulerActionKind::LoadBalancing
        )
    }

    pub fn is_placement(self) -> bool {
        matches!(
            self,
            SchedulerActionKind::NewReplicaPlacement
                | SchedulerActionKind::NewReplicaPlacementWithMove
        )
    }

    pub fn is_client_api(self) -> bool {
        matches!(
            self,
            SchedulerActionKind::ClientApiPromoteToPrimary
                | SchedulerActionKind::ClientApiMovePrimary
                | SchedulerActionKind::ClientApiMoveSecondary
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerActionKind::Upgrade => "Upgrade",
            SchedulerActionKind::ConstraintCheck => "ConstraintCheck",
            SchedulerActionKind::NewReplicaPlacementWithMove => "NewReplicaPlacementWithMove",
            SchedulerActionKind::NewReplicaPlacement => "NewReplicaPlacement",
            SchedulerActionKind::QuickLoadBalancing => "QuickLoadBalancing",
            SchedulerActionKind::LoadBalancing => "LoadBalancing",
            SchedulerActionKind::ClientApiPromoteToPrimary => "ClientApiPromoteToPrimary",
            SchedulerActionKind::ClientApiMovePrimary => "ClientApiMovePrimary",
            SchedulerActionKind::ClientApiMoveSecondary => "ClientApiMoveSecondary",
            SchedulerActionKind::NoActionNeeded => "NoActionNeeded",
            SchedulerActionKind::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Upgrade" => SchedulerActionKind::Upgrade,
            "ConstraintCheck" => SchedulerActionKind::ConstraintCheck,
            "NewReplicaPlacementWithMove" => SchedulerActionKind::NewReplicaPlacementWithMove,
            "NewReplicaPlacement" => SchedulerActionKind::NewReplicaPlacement,
            "QuickLoadBalancing" => SchedulerActionKind::QuickLoadBalancing,
            "LoadBalancing" => SchedulerActionKind::LoadBalancing,
            "ClientApiPromoteToPrimary" => SchedulerActionKind::ClientApiPromoteToPrimary,
            "ClientApiMovePrimary" => SchedulerActionKind::ClientApiMovePrimary,
            "ClientApiMoveSecondary" => SchedulerActionKind::ClientApiMoveSecondary,
            "NoActionNeeded" => SchedulerActionKind::NoActionNeeded,
            _ => SchedulerActionKind::Unknown,
        }
    }
}

impl fmt::Display for SchedulerActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One replica action within a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlbAction {
    pub source_node: Option<NodeId>,
    pub target_node: Option<NodeId>,
    pub kind: ActionKind,
    pub scheduler_action: SchedulerActionKind,
}

impl PlbAction {
    /// Build an action, dropping whichever endpoint the kind does not carry.
    pub fn new(
        kind: ActionKind,
        source_node: Option<NodeId>,
        target_node: Option<NodeId>,
        scheduler_action: SchedulerActionKind,
    ) -> Self {
        debug_assert!(!kind.has_source_node() || source_node.is_some());
        debug_assert!(!kind.has_target_node() || target_node.is_some());
        Self {
            source_node: source_node.filter(|_| kind.has_source_node()),
            target_node: target_node.filter(|_| kind.has_target_node()),
            kind,
            scheduler_action,
        }
    }
}

impl fmt::Display for PlbAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} ({})",
            self.kind,
            self.source_node.as_deref().unwrap_or("-"),
            self.target_node.as_deref().unwrap_or("-"),
            self.scheduler_action
        )
    }
}

/// All actions computed for one failover unit in one refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitMovement {
    pub failover_unit_id: FailoverUnitId,
    pub service_name: String,
    pub is_stateful: bool,
    /// Failover unit version the actions were computed against.
    pub version: u64,
    pub is_in_transition: bool,
    pub actions: Vec<PlbAction>,
}

/// Movements keyed by failover unit; one entry per unit.
pub type FailoverUnitMovementTable = BTreeMap<FailoverUnitId, FailoverUnitMovement>;

/// Why a computed or requested movement was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlbMovementIgnoredReason {
    Invalid,
    ClusterPaused,
    DropAllPLBMovementsConfigTrue,
    FailoverUnitNotFound,
    FailoverUnitIsChanging,
    FailoverUnitIsToBeDeleted,
    VersionMismatch,
    NodePendingClose,
    NodePendingDeactivate,
    NodeIsUploadingReplica,
    ReplicaNotFound,
    InvalidReplicaState,
    ConstraintViolated,
    FailoverManagerBusy,
    /// Reason code this build does not know.
    Unrecognized(u16),
}

impl PlbMovementIgnoredReason {
    pub fn code(self) -> u16 {
        match self {
            PlbMovementIgnoredReason::Invalid => 0,
            PlbMovementIgnoredReason::ClusterPaused => 1,
            PlbMovementIgnoredReason::DropAllPLBMovementsConfigTrue => 2,
            PlbMovementIgnoredReason::FailoverUnitNotFound => 3,
            PlbMovementIgnoredReason::FailoverUnitIsChanging => 4,
            PlbMovementIgnoredReason::FailoverUnitIsToBeDeleted => 5,
            PlbMovementIgnoredReason::VersionMismatch => 6,
            PlbMovementIgnoredReason::NodePendingClose => 7,
            PlbMovementIgnoredReason::NodePendingDeactivate => 8,
            PlbMovementIgnoredReason::NodeIsUploadingReplica => 9,
            PlbMovementIgnoredReason::ReplicaNotFound => 10,
            PlbMovementIgnoredReason::InvalidReplicaState => 11,
            PlbMovementIgnoredReason::ConstraintViolated => 12,
            PlbMovementIgnoredReason::FailoverManagerBusy => 13,
            PlbMovementIgnoredReason::Unrecognized(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => PlbMovementIgnoredReason::Invalid,
            1 => PlbMovementIgnoredReason::ClusterPaused,
            2 => PlbMovementIgnoredReason::DropAllPLBMovementsConfigTrue,
            3 => PlbMovementIgnoredReason::FailoverUnitNotFound,
            4 => PlbMovementIgnoredReason::FailoverUnitIsChanging,
            5 => PlbMovementIgnoredReason::FailoverUnitIsToBeDeleted,
            6 => PlbMovementIgnoredReason::VersionMismatch,
            7 => PlbMovementIgnoredReason::NodePendingClose,
            8 => PlbMovementIgnoredReason::NodePendingDeactivate,
            9 => PlbMovementIgnoredReason::NodeIsUploadingReplica,
            10 => PlbMovementIgnoredReason::ReplicaNotFound,
            11 => PlbMovementIgnoredReason::InvalidReplicaState,
            12 => PlbMovementIgnoredReason::ConstraintViolated,
            13 => PlbMovementIgnoredReason::FailoverManagerBusy,
            other => PlbMovementIgnoredReason::Unrecognized(other),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlbMovementIgnoredReason::Invalid => "Invalid",
            PlbMovementIgnoredReason::ClusterPaused => "ClusterPaused",
            PlbMovementIgnoredReason::DropAllPLBMovementsConfigTrue => {
                "DropAllPLBMovementsConfigTrue"
            }
            PlbMovementIgnoredReason::FailoverUnitNotFound => "FailoverUnitNotFound",
            PlbMovementIgnoredReason::FailoverUnitIsChanging => "FailoverUnitIsChanging",
            PlbMovementIgnoredReason::FailoverUnitIsToBeDeleted => "FailoverUnitIsToBeDeleted",
            PlbMovementIgnoredReason::VersionMismatch => "VersionMismatch",
            PlbMovementIgnoredReason::NodePendingClose => "NodePendingClose",
            PlbMovementIgnoredReason::NodePendingDeactivate => "NodePendingDeactivate",
            PlbMovementIgnoredReason::NodeIsUploadingReplica => "NodeIsUploadingReplica",
            PlbMovementIgnoredReason::ReplicaNotFound => "ReplicaNotFound",
            PlbMovementIgnoredReason::InvalidReplicaState => "InvalidReplicaState",
            PlbMovementIgnoredReason::ConstraintViolated => "ConstraintViolated",
            PlbMovementIgnoredReason::FailoverManagerBusy => "FailoverManagerBusy",
            PlbMovementIgnoredReason::Unrecognized(_) => "Unrecognized",
        }
    }
}

impl fmt::Display for PlbMovementIgnoredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A movement that was computed or requested but not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedMovement {
    pub failover_unit_id: FailoverUnitId,
    pub reason: PlbMovementIgnoredReason,
    pub decision_id: DecisionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [ActionKind; 12] = [
        ActionKind::AddPrimary,
        ActionKind::AddSecondary,
        ActionKind::AddInstance,
        ActionKind::MoveSecondary,
        ActionKind::MoveInstance,
        ActionKind::MovePrimary,
        ActionKind::SwapPrimarySecondary,
        ActionKind::PromoteSecondary,
        ActionKind::RequestedPlacementNotPossible,
        ActionKind::DropPrimary,
        ActionKind::DropSecondary,
        ActionKind::DropInstance,
    ];

    #[test]
    fn every_action_has_an_endpoint() {
        for kind in ALL_KINDS {
            assert!(kind.has_source_node() || kind.has_target_node(), "{kind}");
        }
    }

    #[test]
    fn endpoint_table() {
        assert!(!ActionKind::AddInstance.has_source_node());
        assert!(ActionKind::AddInstance.has_target_node());
        assert!(ActionKind::SwapPrimarySecondary.has_source_node());
        assert!(ActionKind::SwapPrimarySecondary.has_target_node());
        assert!(!ActionKind::PromoteSecondary.has_source_node());
        assert!(ActionKind::RequestedPlacementNotPossible.has_source_node());
        assert!(!ActionKind::RequestedPlacementNotPossible.has_target_node());
        assert!(!ActionKind::DropSecondary.has_target_node());
    }

    #[test]
    fn action_new_strips_unused_endpoint() {
        let action = PlbAction::new(
            ActionKind::DropInstance,
            Some("N1".into()),
            Some("N2".into()),
            SchedulerActionKind::NewReplicaPlacement,
        );
        assert_eq!(action.source_node.as_deref(), Some("N1"));
        assert!(action.target_node.is_none());
    }

    #[test]
    fn unknown_reason_codes_are_preserved() {
        let reason = PlbMovementIgnoredReason::from_code(77);
        assert_eq!(reason, PlbMovementIgnoredReason::Unrecognized(77));
        assert_eq!(reason.code(), 77);
        assert_eq!(reason.as_str(), "Unrecognized");
        assert_eq!(
            PlbMovementIgnoredReason::from_code(6),
            PlbMovementIgnoredReason::VersionMismatch
        );
    }

    #[test]
    fn scheduler_actions_order_by_priority() {
        assert!(SchedulerActionKind::Upgrade < SchedulerActionKind::ConstraintCheck);
        assert!(SchedulerActionKind::NewReplicaPlacement < SchedulerActionKind::LoadBalancing);
        assert_eq!(SchedulerActionKind::parse("Bogus"), SchedulerActionKind::Unknown);
    }
}
