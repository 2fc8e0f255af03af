//! Immutable per-domain views handed to the optimizer.
//!
//! A snapshot is an owned copy of everything one domain needs, taken under
//! the model's read lock and then used without any lock held.

use std::collections::{BTreeMap, BTreeSet};

use plb_core::{
    ApplicationCapacity, DeactivationIntent, FailoverUnitId, MoveCost, NodeId,
    ReplicaDescription, ReplicaRole, ResourceGovernancePolicy, ServiceMetric,
};

use crate::domain::{ApplicationId, DomainId, ServiceId, ServicePackageId};

#[derive(Debug, Clone)]
pub struct NodeView {
    pub id: NodeId,
    pub fault_domain: String,
    pub upgrade_domain: String,
    pub properties: BTreeMap<String, String>,
    pub capacities: BTreeMap<String, i64>,
    pub is_up: bool,
    pub deactivation: Option<DeactivationIntent>,
    pub images: BTreeSet<String>,
}

impl NodeView {
    pub fn capacity(&self, metric: &str) -> Option<i64> {
        self.capacities.get(metric).copied()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceView {
    pub id: ServiceId,
    pub name: String,
    pub service_type: String,
    /// False once the service type has been deleted.
    pub service_type_known: bool,
    pub blocked_nodes: BTreeSet<NodeId>,
    pub is_stateful: bool,
    pub on_every_node: bool,
    pub placement_constraints: String,
    pub affinity_parent: Option<ServiceId>,
    pub affinity_aligned: bool,
    pub metrics: Vec<ServiceMetric>,
    pub default_move_cost: MoveCost,
    pub target_replica_set_size: i32,
    pub application: Option<ApplicationId>,
    pub service_package: Option<ServicePackageId>,
}

impl ServiceView {
    pub fn metric(&self, name: &str) -> Option<&ServiceMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Reported loads and move costs of one failover unit. Metrics without a
/// report fall back to the service defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadTable {
    pub primary: BTreeMap<String, i64>,
    pub secondary: BTreeMap<String, i64>,
    pub secondary_per_node: BTreeMap<NodeId, BTreeMap<String, i64>>,
    pub primary_move_cost: Option<MoveCost>,
    pub secondary_move_cost: Option<MoveCost>,
}

impl LoadTable {
    /// Load a replica in `role` on `node` puts on `metric`.
    pub fn load(
        &self,
        metrics: &[ServiceMetric],
        is_stateful: bool,
        metric: &str,
        role: ReplicaRole,
        node: &str,
    ) -> i64 {
        let default = metrics.iter().find(|m| m.name == metric);
        match role {
            ReplicaRole::Primary if is_stateful => self
                .primary
                .get(metric)
                .copied()
                .or_else(|| default.map(|m| m.primary_default_load))
                .unwrap_or(0),
            ReplicaRole::Primary | ReplicaRole::Secondary => self
                .secondary_per_node
                .get(node)
                .and_then(|loads| loads.get(metric))
                .or_else(|| self.secondary.get(metric))
                .copied()
                .or_else(|| default.map(|m| m.secondary_default_load))
                .unwrap_or(0),
            ReplicaRole::Idle | ReplicaRole::Standby => 0,
        }
    }

    pub fn move_cost(&self, default: MoveCost, role: ReplicaRole) -> MoveCost {
        let reported = match role {
            ReplicaRole::Primary => self.primary_move_cost,
            _ => self.secondary_move_cost,
        };
        reported.unwrap_or(default)
    }
}

#[derive(Debug, Clone)]
pub struct FailoverUnitView {
    pub id: FailoverUnitId,
    pub service: ServiceId,
    pub version: u64,
    pub is_in_transition: bool,
    /// Overrides the service target when set.
    pub target_replica_count: Option<u32>,
    pub replicas: Vec<ReplicaDescription>,
    pub loads: LoadTable,
}

impl FailoverUnitView {
    pub fn load(&self, service: &ServiceView, metric: &str, role: ReplicaRole, node: &str) -> i64 {
        self.loads
            .load(&service.metrics, service.is_stateful, metric, role, node)
    }

    pub fn move_cost(&self, service: &ServiceView, role: ReplicaRole) -> MoveCost {
        self.loads.move_cost(service.default_move_cost, role)
    }

    pub fn healthy_replicas(&self) -> impl Iterator<Item = &ReplicaDescription> {
        self.replicas.iter().filter(|r| r.is_healthy())
    }

    /// Replica count the unit should have, or `None` for on-every-node services.
    pub fn target(&self, service: &ServiceView) -> Option<u32> {
        if service.on_every_node {
            return None;
        }
        Some(
            self.target_replica_count
                .unwrap_or(service.target_replica_set_size.max(0) as u32),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationView {
    pub id: ApplicationId,
    pub name: String,
    pub capacity: Option<ApplicationCapacity>,
    pub upgrade_in_progress: bool,
    pub completed_upgrade_domains: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct ServicePackageView {
    pub id: ServicePackageId,
    pub application: ApplicationId,
    pub name: String,
    pub governance: Option<ResourceGovernancePolicy>,
    pub container_images: Vec<String>,
}

/// Everything the optimizer needs to schedule one domain.
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub domain_id: DomainId,
    pub generation: u64,
    pub load_stamp: u64,
    /// All nodes of the cluster, ascending by id.
    pub nodes: Vec<NodeView>,
    /// Metrics owned by the domain, ascending.
    pub metrics: Vec<String>,
    pub services: BTreeMap<ServiceId, ServiceView>,
    /// Failover units of the domain, ascending by id.
    pub failover_units: Vec<FailoverUnitView>,
    pub applications: BTreeMap<ApplicationId, ApplicationView>,
    pub service_packages: BTreeMap<ServicePackageId, ServicePackageView>,
    pub cluster_upgrade_in_progress: bool,
    pub completed_upgrade_domains: BTreeSet<String>,
    /// Reserved capacity per metric still not covered by load.
    pub unused_reservation: BTreeMap<String, i64>,
}

impl DomainSnapshot {
    pub fn node(&self, id: &str) -> Option<&NodeView> {
        self.nodes
            .binary_search_by(|n| n.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.nodes[idx])
    }

    pub fn failover_unit(&self, id: &FailoverUnitId) -> Option<&FailoverUnitView> {
        self.failover_units
            .binary_search_by(|fu| fu.id.cmp(id))
            .ok()
            .map(|idx| &self.failover_units[idx])
    }

    pub fn service_of(&self, fu: &FailoverUnitView) -> &ServiceView {
        &self.services[&fu.service]
    }

    /// Whether an upgrade is running for the cluster or any application of
    /// the domain.
    pub fn upgrade_in_progress(&self) -> bool {
        self.cluster_upgrade_in_progress
            || self.applications.values().any(|a| a.upgrade_in_progress)
    }

    /// Upgrade domains already upgraded, for the cluster or the given application.
    pub fn is_upgrade_domain_completed(&self, ud: &str, app: Option<ApplicationId>) -> bool {
        if self.completed_upgrade_domains.contains(ud) {
            return true;
        }
        app.and_then(|id| self.applications.get(&id))
            .is_some_and(|a| a.upgrade_in_progress && a.completed_upgrade_domains.contains(ud))
    }
}
