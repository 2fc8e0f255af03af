//! Mutable working copy of a domain snapshot.
//!
//! The searches move replicas around in a `PlacementState`, never in the
//! snapshot itself. Node and failover unit references are indices into
//! `snapshot.nodes` and `snapshot.failover_units`, both sorted ascending,
//! so iterating indices in order is iterating ids in order.

use std::collections::{BTreeMap, BTreeSet};

use plb_core::{
    CPU_CORES_METRIC, CPU_CORES_SCALE, MEMORY_IN_MB_METRIC, PlbConfig, ReplicaFlags, ReplicaRole,
    ReplicaState, ResourceGovernancePolicy,
};
use plb_model::{
    ApplicationId, DomainSnapshot, FailoverUnitView, NodeView, ServiceId, ServicePackageId,
    ServiceView,
};

use crate::expression::{Expr, ExpressionError};

/// A healthy replica in the working placement.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingReplica {
    pub node: usize,
    pub role: ReplicaRole,
    /// Being built, either reported by the authority or placed by this pass.
    pub in_build: bool,
    pub flags: ReplicaFlags,
}

pub fn is_governance_metric(metric: &str) -> bool {
    metric == CPU_CORES_METRIC || metric == MEMORY_IN_MB_METRIC
}

pub struct PlacementState<'a> {
    pub snapshot: &'a DomainSnapshot,
    pub config: &'a PlbConfig,
    replicas: Vec<Vec<WorkingReplica>>,
    /// Nodes holding a replica that is not healthy (down, dropped, idle...).
    occupied: Vec<BTreeSet<usize>>,
    node_loads: Vec<BTreeMap<String, i64>>,
    in_build: Vec<u32>,
    package_replicas: BTreeMap<(ServicePackageId, usize), u32>,
    app_loads: BTreeMap<(ApplicationId, usize), BTreeMap<String, i64>>,
    app_replicas: BTreeMap<(ApplicationId, usize), u32>,
    expressions: BTreeMap<ServiceId, Result<Expr, ExpressionError>>,
    by_service: BTreeMap<ServiceId, Vec<usize>>,
    children: BTreeMap<ServiceId, Vec<ServiceId>>,
}

impl<'a> PlacementState<'a> {
    pub fn new(snapshot: &'a DomainSnapshot, config: &'a PlbConfig) -> Self {
        let node_count = snapshot.nodes.len();
        let mut state = Self {
            snapshot,
            config,
            replicas: vec![Vec::new(); snapshot.failover_units.len()],
            occupied: vec![BTreeSet::new(); snapshot.failover_units.len()],
            node_loads: vec![BTreeMap::new(); node_count],
            in_build: vec![0; node_count],
            package_replicas: BTreeMap::new(),
            app_loads: BTreeMap::new(),
            app_replicas: BTreeMap::new(),
            expressions: snapshot
                .services
                .values()
                .map(|s| (s.id, Expr::parse(&s.placement_constraints)))
                .collect(),
            by_service: BTreeMap::new(),
            children: BTreeMap::new(),
        };
        for service in snapshot.services.values() {
            if let Some(parent) = service.affinity_parent {
                state.children.entry(parent).or_default().push(service.id);
            }
        }

        for (fu_idx, fu) in snapshot.failover_units.iter().enumerate() {
            state.by_service.entry(fu.service).or_default().push(fu_idx);
            for replica in &fu.replicas {
                let Some(node) = state.node_index(&replica.node_id) else {
                    continue;
                };
                if !replica.is_healthy() {
                    state.occupied[fu_idx].insert(node);
                    continue;
                }
                let working = WorkingReplica {
                    node,
                    role: replica.role,
                    in_build: replica.state == ReplicaState::InBuild,
                    flags: replica.flags,
                };
                state.attach(fu_idx, working);
            }
        }
        state
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.snapshot
            .nodes
            .binary_search_by(|n| n.id.as_str().cmp(id))
            .ok()
    }

    pub fn failover_unit_index(&self, id: &plb_core::FailoverUnitId) -> Option<usize> {
        self.snapshot
            .failover_units
            .binary_search_by(|fu| fu.id.cmp(id))
            .ok()
    }

    pub fn node(&self, idx: usize) -> &NodeView {
        &self.snapshot.nodes[idx]
    }

    pub fn node_count(&self) -> usize {
        self.snapshot.nodes.len()
    }

    pub fn failover_unit_count(&self) -> usize {
        self.snapshot.failover_units.len()
    }

    pub fn fu(&self, idx: usize) -> &FailoverUnitView {
        &self.snapshot.failover_units[idx]
    }

    pub fn service(&self, fu: usize) -> &ServiceView {
        self.snapshot.service_of(self.fu(fu))
    }

    pub fn failover_units_of(&self, service: ServiceId) -> &[usize] {
        self.by_service.get(&service).map_or(&[], Vec::as_slice)
    }

    /// Services with an affinity to `parent`.
    pub fn children_of(&self, parent: ServiceId) -> &[ServiceId] {
        self.children.get(&parent).map_or(&[], Vec::as_slice)
    }

    pub fn expression(&self, service: ServiceId) -> Option<&Result<Expr, ExpressionError>> {
        self.expressions.get(&service)
    }

    pub fn replicas(&self, fu: usize) -> &[WorkingReplica] {
        &self.replicas[fu]
    }

    pub fn replica_on(&self, fu: usize, node: usize) -> Option<&WorkingReplica> {
        self.replicas[fu].iter().find(|r| r.node == node)
    }

    pub fn primary(&self, fu: usize) -> Option<&WorkingReplica> {
        self.replicas[fu].iter().find(|r| r.role == ReplicaRole::Primary)
    }

    /// Whether the failover unit has any replica, healthy or not, on the node.
    pub fn hosts(&self, fu: usize, node: usize) -> bool {
        self.occupied[fu].contains(&node) || self.replica_on(fu, node).is_some()
    }

    pub fn node_load(&self, node: usize, metric: &str) -> i64 {
        self.node_loads[node].get(metric).copied().unwrap_or(0)
    }

    pub fn in_build_count(&self, node: usize) -> u32 {
        self.in_build[node]
    }

    pub fn total_replicas(&self) -> usize {
        self.replicas.iter().map(Vec::len).sum()
    }

    /// Whether new replicas may land on the node at all.
    pub fn is_node_eligible(&self, node: usize) -> bool {
        let node = self.node(node);
        node.is_up && node.deactivation.is_none()
    }

    pub fn governance(&self, service: &ServiceView) -> Option<&ResourceGovernancePolicy> {
        service
            .service_package
            .and_then(|p| self.snapshot.service_packages.get(&p))
            .and_then(|p| p.governance.as_ref())
            .filter(|g| g.is_governed())
    }

    /// Load a service package's governance puts on a node once it has a replica there.
    pub fn governance_load(&self, service: &ServiceView, metric: &str) -> i64 {
        let Some(policy) = self.governance(service) else {
            return 0;
        };
        match metric {
            CPU_CORES_METRIC => (policy.cpu_cores * CPU_CORES_SCALE).round() as i64,
            MEMORY_IN_MB_METRIC => policy.memory_in_mb as i64,
            _ => 0,
        }
    }

    pub fn package_replicas_on(&self, package: ServicePackageId, node: usize) -> u32 {
        self.package_replicas.get(&(package, node)).copied().unwrap_or(0)
    }

    /// Load a replica of `fu` in `role` would put on `node` for `metric`.
    /// Governance metrics are accounted per package, not per replica.
    pub fn replica_load(&self, fu: usize, metric: &str, role: ReplicaRole, node: usize) -> i64 {
        let service = self.service(fu);
        if is_governance_metric(metric) && self.governance(service).is_some() {
            return 0;
        }
        self.fu(fu).load(service, metric, role, &self.node(node).id)
    }

    pub fn app_load(&self, app: ApplicationId, node: usize, metric: &str) -> i64 {
        self.app_loads
            .get(&(app, node))
            .and_then(|l| l.get(metric))
            .copied()
            .unwrap_or(0)
    }

    pub fn app_total_load(&self, app: ApplicationId, metric: &str) -> i64 {
        self.app_loads
            .range((app, 0)..=(app, usize::MAX))
            .filter_map(|(_, loads)| loads.get(metric))
            .sum()
    }

    pub fn app_node_count(&self, app: ApplicationId) -> usize {
        self.app_replicas
            .range((app, 0)..=(app, usize::MAX))
            .filter(|(_, count)| **count > 0)
            .count()
    }

    pub fn app_on_node(&self, app: ApplicationId, node: usize) -> bool {
        self.app_replicas.get(&(app, node)).is_some_and(|c| *c > 0)
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Place a new replica; it counts as in build on the target.
    pub fn add_replica(&mut self, fu: usize, node: usize, role: ReplicaRole) {
        debug_assert!(!self.hosts(fu, node), "node already hosts a replica of the unit");
        let replica = WorkingReplica {
            node,
            role,
            in_build: true,
            flags: ReplicaFlags::default(),
        };
        self.attach(fu, replica);
    }

    pub fn remove_replica(&mut self, fu: usize, node: usize) -> WorkingReplica {
        let Some(pos) = self.replicas[fu].iter().position(|r| r.node == node) else {
            panic!("no replica of failover unit #{fu} on node #{node}");
        };
        let replica = self.replicas[fu].remove(pos);
        self.account(fu, &replica, -1);
        replica
    }

    /// Put back a replica previously taken out with `remove_replica`.
    pub fn restore_replica(&mut self, fu: usize, replica: WorkingReplica) {
        debug_assert!(!self.hosts(fu, replica.node), "node already hosts a replica of the unit");
        self.attach(fu, replica);
    }

    pub fn move_replica(&mut self, fu: usize, from: usize, to: usize) {
        let replica = self.remove_replica(fu, from);
        self.attach(
            fu,
            WorkingReplica {
                node: to,
                role: replica.role,
                in_build: true,
                flags: ReplicaFlags::default(),
            },
        );
    }

    /// Exchange the roles of the primary and a secondary.
    pub fn swap_roles(&mut self, fu: usize, primary: usize, secondary: usize) {
        let p = self.remove_replica(fu, primary);
        let s = self.remove_replica(fu, secondary);
        debug_assert_eq!(p.role, ReplicaRole::Primary);
        self.attach(fu, WorkingReplica { role: ReplicaRole::Secondary, ..p });
        self.attach(fu, WorkingReplica { role: ReplicaRole::Primary, ..s });
    }

    fn attach(&mut self, fu: usize, replica: WorkingReplica) {
        self.account(fu, &replica, 1);
        let list = &mut self.replicas[fu];
        let pos = list.partition_point(|r| r.node < replica.node);
        list.insert(pos, replica);
    }

    fn account(&mut self, fu: usize, replica: &WorkingReplica, sign: i64) {
        let node = replica.node;
        let service = self.service(fu);
        let app = service.application;
        let package = self.governance(service).and(service.service_package);
        let loads: Vec<(String, i64)> = service
            .metrics
            .iter()
            .map(|m| (m.name.clone(), self.replica_load(fu, &m.name, replica.role, node)))
            .collect();
        let governance: Vec<(&'static str, i64)> = [CPU_CORES_METRIC, MEMORY_IN_MB_METRIC]
            .into_iter()
            .map(|m| (m, self.governance_load(service, m)))
            .filter(|(_, v)| *v > 0)
            .collect();

        for (metric, load) in &loads {
            bump(&mut self.node_loads[node], metric, sign * load);
        }
        if let Some(app) = app {
            let app_loads = self.app_loads.entry((app, node)).or_default();
            for (metric, load) in &loads {
                bump(app_loads, metric, sign * load);
            }
            let count = self.app_replicas.entry((app, node)).or_insert(0);
            *count = count.checked_add_signed(sign as i32).unwrap_or_else(|| {
                panic!("application replica counter on node #{node} went negative")
            });
        }
        if let Some(package) = package {
            let count = self.package_replicas.entry((package, node)).or_insert(0);
            let first_or_last = (sign > 0 && *count == 0) || (sign < 0 && *count == 1);
            *count = count.checked_add_signed(sign as i32).unwrap_or_else(|| {
                panic!("package replica counter on node #{node} went negative")
            });
            if first_or_last {
                for (metric, load) in &governance {
                    bump(&mut self.node_loads[node], metric, sign * load);
                }
            }
        }
        if replica.in_build {
            let count = &mut self.in_build[node];
            *count = count.checked_add_signed(sign as i32).unwrap_or_else(|| {
                panic!("in-build counter on node #{node} went negative")
            });
        }
    }
}

fn bump(loads: &mut BTreeMap<String, i64>, metric: &str, delta: i64) {
    if delta == 0 {
        return;
    }
    let entry = loads.entry(metric.to_string()).or_insert(0);
    *entry += delta;
    if *entry == 0 {
        loads.remove(metric);
    }
}
