//! Hard constraints on replica placement.
//!
//! Checks run in a fixed precedence and stop at the first violation:
//! service type, node state, placement expression and block list,
//! fault/upgrade domain spread, affinity, then capacity (node capacity,
//! reservation, application capacity, resource governance, in-build
//! throttling). Replicas of on-every-node services are never moved.

use thiserror::Error;

use plb_core::{DeactivationIntent, ReplicaRole};

use crate::state::{PlacementState, is_governance_metric};

/// Why a replica cannot be (or stay) on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum Violation {
    #[error("service type is unknown")]
    UnknownServiceType,
    #[error("node is down")]
    NodeDown,
    #[error("node is being deactivated")]
    NodeDeactivating,
    #[error("node already hosts a replica of the failover unit")]
    ReplicaAlreadyOnNode,
    #[error("placement constraint expression is invalid")]
    InvalidPlacementConstraint,
    #[error("placement constraint not satisfied")]
    PlacementConstraint,
    #[error("node is blocked for the service type")]
    BlockedNode,
    #[error("fault domain already holds its share of replicas")]
    FaultDomain,
    #[error("upgrade domain already holds its share of replicas")]
    UpgradeDomain,
    #[error("affinity to the parent service not satisfied")]
    Affinity,
    #[error("node capacity exceeded for metric {metric}")]
    Capacity { metric: String },
    #[error("reserved capacity would be consumed for metric {metric}")]
    Reservation { metric: String },
    #[error("application capacity exceeded for metric {metric}")]
    ApplicationCapacity { metric: String },
    #[error("application scale-out limit reached")]
    ScaleoutCount,
    #[error("resource governance capacity exceeded for metric {metric}")]
    ResourceGovernance { metric: String },
    #[error("node is building too many replicas")]
    InBuildThrottled,
    #[error("replica is not ready")]
    ReplicaNotReady,
    #[error("on-every-node services are not moved")]
    OnEveryNode,
}

impl Violation {
    /// Stable name used as a statistics and query key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Violation::UnknownServiceType => "UnknownServiceType",
            Violation::NodeDown => "NodeDown",
            Violation::NodeDeactivating => "NodeDeactivating",
            Violation::ReplicaAlreadyOnNode => "ReplicaAlreadyOnNode",
            Violation::InvalidPlacementConstraint => "InvalidPlacementConstraint",
            Violation::PlacementConstraint => "PlacementConstraint",
            Violation::BlockedNode => "BlockedNode",
            Violation::FaultDomain => "FaultDomain",
            Violation::UpgradeDomain => "UpgradeDomain",
            Violation::Affinity => "Affinity",
            Violation::Capacity { .. } => "Capacity",
            Violation::Reservation { .. } => "Reservation",
            Violation::ApplicationCapacity { .. } => "ApplicationCapacity",
            Violation::ScaleoutCount => "ScaleoutCount",
            Violation::ResourceGovernance { .. } => "ResourceGovernance",
            Violation::InBuildThrottled => "InBuildThrottled",
            Violation::ReplicaNotReady => "ReplicaNotReady",
            Violation::OnEveryNode => "OnEveryNode",
        }
    }
}

/// What is being placed on the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// A new replica in the given role.
    New(ReplicaRole),
    /// The replica currently on the source node.
    Move { from: usize },
}

/// An existing replica that breaks a hard constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingViolation {
    pub fu: usize,
    pub node: usize,
    pub violation: Violation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Place,
    Existing,
}

/// Check placing a replica of `fu` on `target`.
///
/// `use_buffer` keeps the configured node buffer free, which placement and
/// balancing do and constraint fixing does not.
pub fn check_placement(
    state: &PlacementState,
    fu: usize,
    target: usize,
    placement: Placement,
    use_buffer: bool,
) -> Result<(), Violation> {
    let (role, exclude) = match placement {
        Placement::New(role) => (role, None),
        Placement::Move { from } => {
            let Some(replica) = state.replica_on(fu, from) else {
                panic!("move of failover unit #{fu} from node #{from} without a replica");
            };
            if state.service(fu).on_every_node {
                return Err(Violation::OnEveryNode);
            }
            (replica.role, Some(from))
        }
    };

    let service = state.service(fu);
    if !service.service_type_known {
        return Err(Violation::UnknownServiceType);
    }
    let node = state.node(target);
    if !node.is_up {
        return Err(Violation::NodeDown);
    }
    if node.deactivation.is_some() {
        return Err(Violation::NodeDeactivating);
    }
    if state.hosts(fu, target) {
        return Err(Violation::ReplicaAlreadyOnNode);
    }

    evaluate(state, fu, target, role, exclude, Mode::Place, use_buffer)?;
    if let Some(from) = exclude {
        check_children_stay_with_parent(state, fu, from)?;
    }
    Ok(())
}

/// Check whether the replica of `fu` on `node` may stay where it is.
pub fn check_existing(state: &PlacementState, fu: usize, node: usize) -> Result<(), Violation> {
    let Some(replica) = state.replica_on(fu, node) else {
        return Ok(());
    };
    let role = replica.role;
    let intent = state.node(node).deactivation;
    if matches!(
        intent,
        Some(DeactivationIntent::RemoveData | DeactivationIntent::RemoveNode)
    ) && !state.service(fu).on_every_node
    {
        return Err(Violation::NodeDeactivating);
    }
    evaluate(state, fu, node, role, Some(node), Mode::Existing, false)
}

/// Check exchanging the primary on `primary` with the secondary on `secondary`.
pub fn check_swap(
    state: &PlacementState,
    fu: usize,
    primary: usize,
    secondary: usize,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let Some(candidate) = state.replica_on(fu, secondary) else {
        return Err(Violation::ReplicaNotReady);
    };
    if candidate.in_build || candidate.role != ReplicaRole::Secondary {
        return Err(Violation::ReplicaNotReady);
    }
    if state.node(secondary).deactivation.is_some() {
        return Err(Violation::NodeDeactivating);
    }

    for metric in &service.metrics {
        if is_governance_metric(&metric.name) && state.governance(service).is_some() {
            continue;
        }
        let p_on_s = state.replica_load(fu, &metric.name, ReplicaRole::Primary, secondary);
        let s_on_s = state.replica_load(fu, &metric.name, ReplicaRole::Secondary, secondary);
        let p_on_p = state.replica_load(fu, &metric.name, ReplicaRole::Primary, primary);
        let s_on_p = state.replica_load(fu, &metric.name, ReplicaRole::Secondary, primary);
        for (node, delta) in [(secondary, p_on_s - s_on_s), (primary, s_on_p - p_on_p)] {
            if delta <= 0 {
                continue;
            }
            if exceeds_capacity(state, node, &metric.name, state.node_load(node, &metric.name) + delta, true) {
                return Err(Violation::Capacity {
                    metric: metric.name.clone(),
                });
            }
        }
    }

    // Aligned children follow their parent's primary; an aligned child's
    // primary must sit with the parent's primary.
    if let Some(parent) = service.affinity_parent
        && service.affinity_aligned
        && !parent_has_replica(state, parent, secondary, Some(ReplicaRole::Primary))
        && has_any_parent_replica(state, parent)
    {
        return Err(Violation::Affinity);
    }
    for child in state.children_of(service.id) {
        let child_view = &state.snapshot.services[child];
        if !child_view.affinity_aligned {
            continue;
        }
        let child_primary_here = state
            .failover_units_of(*child)
            .iter()
            .any(|c| state.primary(*c).is_some_and(|r| r.node == primary));
        if child_primary_here {
            return Err(Violation::Affinity);
        }
    }
    Ok(())
}

/// Every replica of the domain that currently breaks a hard constraint,
/// in failover unit then node order. Units in transition are skipped.
pub fn find_violations(state: &PlacementState) -> Vec<ExistingViolation> {
    let mut out = Vec::new();
    for fu in 0..state.failover_unit_count() {
        if state.fu(fu).is_in_transition {
            continue;
        }
        for replica in state.replicas(fu) {
            if let Err(violation) = check_existing(state, fu, replica.node) {
                out.push(ExistingViolation {
                    fu,
                    node: replica.node,
                    violation,
                });
            }
        }
    }
    out
}

fn evaluate(
    state: &PlacementState,
    fu: usize,
    target: usize,
    role: ReplicaRole,
    exclude: Option<usize>,
    mode: Mode,
    use_buffer: bool,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let node = state.node(target);

    match state.expression(service.id) {
        Some(Ok(expr)) if !expr.matches(node) => return Err(Violation::PlacementConstraint),
        Some(Err(_)) => return Err(Violation::InvalidPlacementConstraint),
        _ => {}
    }
    if service.blocked_nodes.contains(&node.id) {
        return Err(Violation::BlockedNode);
    }

    if !service.on_every_node {
        check_spread(state, fu, target, exclude)?;
    }
    check_affinity(state, fu, target, role)?;
    check_capacity(state, fu, target, role, exclude, mode, use_buffer)
}

fn check_spread(
    state: &PlacementState,
    fu: usize,
    target: usize,
    exclude: Option<usize>,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let others: Vec<usize> = state
        .replicas(fu)
        .iter()
        .map(|r| r.node)
        .filter(|n| Some(*n) != exclude)
        .collect();
    let target_count = state
        .fu(fu)
        .target(service)
        .map_or(0, |t| t as usize)
        .max(others.len() + 1);

    let checks: [(bool, fn(&plb_model::NodeView) -> &str, Violation); 2] = [
        (state.config.fault_domain_enabled, |n| n.fault_domain.as_str(), Violation::FaultDomain),
        (state.config.upgrade_domain_enabled, |n| n.upgrade_domain.as_str(), Violation::UpgradeDomain),
    ];
    for (enabled, domain_of, violation) in checks {
        let domain = domain_of(state.node(target));
        if !enabled || domain.is_empty() {
            continue;
        }
        let mut distinct: Vec<&str> = (0..state.node_count())
            .filter(|n| state.is_node_eligible(*n) || *n == target)
            .map(|n| domain_of(state.node(n)))
            .filter(|d| !d.is_empty())
            .collect();
        distinct.sort_unstable();
        distinct.dedup();
        let allowed = target_count.div_ceil(distinct.len().max(1));
        let already = others
            .iter()
            .filter(|n| domain_of(state.node(**n)) == domain)
            .count();
        if already + 1 > allowed {
            return Err(violation);
        }
    }
    Ok(())
}

fn check_affinity(
    state: &PlacementState,
    fu: usize,
    target: usize,
    role: ReplicaRole,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let Some(parent) = service.affinity_parent else {
        return Ok(());
    };
    if !has_any_parent_replica(state, parent) {
        return if state.config.place_child_without_parent {
            Ok(())
        } else {
            Err(Violation::Affinity)
        };
    }
    let required_role = (service.affinity_aligned && role == ReplicaRole::Primary)
        .then_some(ReplicaRole::Primary);
    if parent_has_replica(state, parent, target, required_role) {
        Ok(())
    } else {
        Err(Violation::Affinity)
    }
}

fn has_any_parent_replica(state: &PlacementState, parent: plb_model::ServiceId) -> bool {
    state
        .failover_units_of(parent)
        .iter()
        .any(|p| !state.replicas(*p).is_empty())
}

fn parent_has_replica(
    state: &PlacementState,
    parent: plb_model::ServiceId,
    node: usize,
    role: Option<ReplicaRole>,
) -> bool {
    state.failover_units_of(parent).iter().any(|p| {
        state
            .replica_on(*p, node)
            .is_some_and(|r| role.is_none_or(|want| r.role == want))
    })
}

/// Moving a parent replica away must not strand a child replica.
fn check_children_stay_with_parent(state: &PlacementState, fu: usize, from: usize) -> Result<(), Violation> {
    let service = state.service(fu);
    let children = state.children_of(service.id);
    if children.is_empty() {
        return Ok(());
    }
    let other_parent_replica = state
        .failover_units_of(service.id)
        .iter()
        .any(|p| *p != fu && state.replica_on(*p, from).is_some());
    if other_parent_replica {
        return Ok(());
    }
    let stranded = children
        .iter()
        .flat_map(|c| state.failover_units_of(*c))
        .any(|c| state.replica_on(*c, from).is_some());
    if stranded {
        Err(Violation::Affinity)
    } else {
        Ok(())
    }
}

fn exceeds_capacity(state: &PlacementState, node: usize, metric: &str, load: i64, use_buffer: bool) -> bool {
    let Some(capacity) = state.node(node).capacity(metric) else {
        return false;
    };
    let limit = if use_buffer {
        capacity as f64 * (1.0 - state.config.node_buffer(metric))
    } else {
        capacity as f64
    };
    load as f64 > limit
}

fn check_capacity(
    state: &PlacementState,
    fu: usize,
    target: usize,
    role: ReplicaRole,
    exclude: Option<usize>,
    mode: Mode,
    use_buffer: bool,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let is_new = mode == Mode::Place && exclude.is_none();

    for metric in &service.metrics {
        if is_governance_metric(&metric.name) && state.governance(service).is_some() {
            continue;
        }
        let load = state.replica_load(fu, &metric.name, role, target);
        let node_load = match mode {
            Mode::Place => state.node_load(target, &metric.name) + load,
            Mode::Existing => state.node_load(target, &metric.name),
        };
        if load > 0 && exceeds_capacity(state, target, &metric.name, node_load, use_buffer) {
            return Err(Violation::Capacity {
                metric: metric.name.clone(),
            });
        }
    }

    if is_new {
        check_reservation(state, fu, target, role)?;
    }
    check_application_capacity(state, fu, target, role, exclude, mode)?;

    if mode == Mode::Place {
        if let (Some(package), Some(_)) = (service.service_package, state.governance(service))
            && state.package_replicas_on(package, target) == 0
        {
            for metric in [plb_core::CPU_CORES_METRIC, plb_core::MEMORY_IN_MB_METRIC] {
                let load = state.governance_load(service, metric);
                if load > 0 && exceeds_capacity(state, target, metric, state.node_load(target, metric) + load, false) {
                    return Err(Violation::ResourceGovernance {
                        metric: metric.to_string(),
                    });
                }
            }
        }
        if let Some(limit) = state.config.maximum_in_build_replicas_per_node
            && state.in_build_count(target) >= limit
        {
            return Err(Violation::InBuildThrottled);
        }
    }
    Ok(())
}

/// A new replica must leave enough free capacity in the cluster for the
/// reservations of app-group applications not yet covered by load.
fn check_reservation(state: &PlacementState, fu: usize, target: usize, role: ReplicaRole) -> Result<(), Violation> {
    let service = state.service(fu);
    let own_reservation = |metric: &str| {
        service
            .application
            .and_then(|a| state.snapshot.applications.get(&a))
            .and_then(|a| a.capacity.as_ref())
            .is_some_and(|c| c.metrics.iter().any(|m| m.name == metric && m.reservation_per_node > 0))
    };
    for (metric, unused) in &state.snapshot.unused_reservation {
        if *unused <= 0 || own_reservation(metric) {
            continue;
        }
        let load = state.replica_load(fu, metric, role, target);
        if load == 0 {
            continue;
        }
        let free: i64 = (0..state.node_count())
            .filter(|n| state.is_node_eligible(*n))
            .filter_map(|n| {
                state
                    .node(n)
                    .capacity(metric)
                    .map(|c| (c - state.node_load(n, metric)).max(0))
            })
            .sum();
        if free - load < *unused {
            return Err(Violation::Reservation { metric: metric.clone() });
        }
    }
    Ok(())
}

fn check_application_capacity(
    state: &PlacementState,
    fu: usize,
    target: usize,
    role: ReplicaRole,
    exclude: Option<usize>,
    mode: Mode,
) -> Result<(), Violation> {
    let service = state.service(fu);
    let Some(app) = service.application else {
        return Ok(());
    };
    let Some(capacity) = state
        .snapshot
        .applications
        .get(&app)
        .and_then(|a| a.capacity.as_ref())
    else {
        return Ok(());
    };

    for metric in &capacity.metrics {
        let load = match mode {
            Mode::Place => state.replica_load(fu, &metric.name, role, target),
            Mode::Existing => 0,
        };
        if metric.max_load_per_node > 0
            && state.app_load(app, target, &metric.name) + load > metric.max_load_per_node
        {
            return Err(Violation::ApplicationCapacity {
                metric: metric.name.clone(),
            });
        }
        if mode == Mode::Place
            && exclude.is_none()
            && metric.total_capacity > 0
            && state.app_total_load(app, &metric.name) + load > metric.total_capacity
        {
            return Err(Violation::ApplicationCapacity {
                metric: metric.name.clone(),
            });
        }
    }

    if mode == Mode::Place && capacity.max_nodes > 0 && !state.app_on_node(app, target) {
        let mut nodes = state.app_node_count(app);
        if let Some(from) = exclude {
            let leaves_source = state
                .failover_units_of(service.id)
                .iter()
                .filter(|f| state.replica_on(**f, from).is_some())
                .count()
                == 1;
            let other_services_on_source = state.snapshot.services.values().any(|s| {
                s.id != service.id
                    && s.application == Some(app)
                    && state
                        .failover_units_of(s.id)
                        .iter()
                        .any(|f| state.replica_on(*f, from).is_some())
            });
            if leaves_source && !other_services_on_source {
                nodes = nodes.saturating_sub(1);
            }
        }
        if nodes >= capacity.max_nodes as usize {
            return Err(Violation::ScaleoutCount);
        }
    }
    Ok(())
}
