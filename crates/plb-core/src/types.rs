//! Description types pushed into the PLB by the failover authority.
//!
//! Every description is a plain value: the engine replaces its stored copy
//! wholesale on each `Update*` call. All types are serializable so that
//! cluster snapshots can be loaded from JSON.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Unique identifier for a failover unit (partition).
pub type FailoverUnitId = Uuid;

/// Metric carrying the CPU cores governed by a service package.
pub const CPU_CORES_METRIC: &str = "servicefabric:/_CpuCores";

/// `CPU_CORES_METRIC` loads and capacities are expressed in thousandths of a core.
pub const CPU_CORES_SCALE: f64 = 1000.0;

/// Metric carrying the memory (MB) governed by a service package.
pub const MEMORY_IN_MB_METRIC: &str = "servicefabric:/_MemoryInMB";

/// Implicit metric counting primaries.
pub const PRIMARY_COUNT_METRIC: &str = "__PrimaryCount__";

/// Implicit metric counting stateful replicas.
pub const REPLICA_COUNT_METRIC: &str = "__ReplicaCount__";

/// Implicit metric counting every replica and instance.
pub const COUNT_METRIC: &str = "__Count__";

// ── Node ───────────────────────────────────────────────────────────

/// Why a node is being taken out of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationIntent {
    Pause,
    Restart,
    RemoveData,
    RemoveNode,
}

/// Topology and capacity of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub node_id: NodeId,
    /// Fault-domain path, e.g. `fd:/dc1/rack2`.
    #[serde(default)]
    pub fault_domain: String,
    #[serde(default)]
    pub upgrade_domain: String,
    /// Node properties referenced by placement constraints.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Capacity per metric. Metrics without an entry are unbounded.
    #[serde(default)]
    pub capacities: BTreeMap<String, i64>,
    pub is_up: bool,
    #[serde(default)]
    pub deactivation: Option<DeactivationIntent>,
}

impl NodeDescription {
    /// Whether new replicas may be placed on this node.
    pub fn accepts_replicas(&self) -> bool {
        self.is_up && self.deactivation.is_none()
    }
}

// ── Service type ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTypeDescription {
    pub name: String,
    /// Nodes on which services of this type must never be placed.
    #[serde(default)]
    pub blocked_nodes: BTreeSet<NodeId>,
}

// ── Service ────────────────────────────────────────────────────────

/// Relative cost of moving a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveCost {
    Zero,
    #[default]
    Low,
    Medium,
    High,
}

/// A load metric declared by a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetric {
    pub name: String,
    /// Relative weight of this metric when balancing (0.0..=1.0).
    #[serde(default = "default_metric_weight")]
    pub weight: f64,
    #[serde(default)]
    pub primary_default_load: i64,
    /// Default load of secondaries, and of stateless instances.
    #[serde(default)]
    pub secondary_default_load: i64,
}

fn default_metric_weight() -> f64 {
    1.0
}

impl ServiceMetric {
    pub fn new(name: &str, weight: f64, primary: i64, secondary: i64) -> Self {
        Self {
            name: name.to_string(),
            weight,
            primary_default_load: primary,
            secondary_default_load: secondary,
        }
    }
}

/// Affinity of a child service to a parent service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAffinity {
    pub parent_service: String,
    /// Aligned affinity co-locates primaries with primaries and
    /// secondaries with secondaries.
    #[serde(default)]
    pub aligned: bool,
}

/// What the auto-scaler measures for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingTrigger {
    pub metric_name: String,
    pub lower_load_threshold: f64,
    pub upper_load_threshold: f64,
    /// Minimum time between two scaling operations, in seconds.
    pub scale_interval_secs: u64,
    #[serde(default)]
    pub use_only_primary_load: bool,
}

/// How the auto-scaler changes a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutoScalingMechanism {
    /// Changes the instance count of every partition (stateless only).
    InstanceCount {
        min_instance_count: u32,
        /// `-1` means unbounded.
        max_instance_count: i32,
        scale_increment: u32,
    },
    /// Adds or removes named partitions.
    AddRemoveIncrementalNamedPartition {
        min_partition_count: u32,
        /// `-1` means unbounded.
        max_partition_count: i32,
        scale_increment: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingPolicy {
    pub trigger: AutoScalingTrigger,
    pub mechanism: AutoScalingMechanism,
}

/// Definition of a service, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub service_type: String,
    #[serde(default)]
    pub application: Option<String>,
    /// Service package (within the application) hosting this service.
    #[serde(default)]
    pub service_package: Option<String>,
    pub is_stateful: bool,
    /// Placement constraint expression; empty means unconstrained.
    #[serde(default)]
    pub placement_constraints: String,
    #[serde(default)]
    pub affinity: Option<ServiceAffinity>,
    #[serde(default)]
    pub metrics: Vec<ServiceMetric>,
    #[serde(default)]
    pub default_move_cost: MoveCost,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    /// Target replicas (stateful) or instances (stateless) per partition.
    /// `-1` places a stateless instance on every eligible node.
    pub target_replica_set_size: i32,
    #[serde(default)]
    pub auto_scaling_policies: Vec<AutoScalingPolicy>,
}

fn default_partition_count() -> u32 {
    1
}

impl ServiceDescription {
    pub fn is_on_every_node(&self) -> bool {
        !self.is_stateful && self.target_replica_set_size < 0
    }

    /// Declared metrics, or the implicit count metrics when none are declared.
    pub fn effective_metrics(&self) -> Vec<ServiceMetric> {
        if !self.metrics.is_empty() {
            return self.metrics.clone();
        }
        vec![
            ServiceMetric::new(PRIMARY_COUNT_METRIC, 1.0, 1, 0),
            ServiceMetric::new(REPLICA_COUNT_METRIC, 0.3, 1, 1),
            ServiceMetric::new(COUNT_METRIC, 0.1, 1, 1),
        ]
    }
}

// ── Application & service package ─────────────────────────────────

/// Per-code-package resource governance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodePackageGovernance {
    pub name: String,
    #[serde(default)]
    pub cpu_shares: u32,
    /// Explicit CPU set, e.g. `"0-3"` or `"0,2"`.
    #[serde(default)]
    pub cpuset_cpus: Option<String>,
    #[serde(default)]
    pub memory_in_mb: u64,
    #[serde(default)]
    pub memory_swap_in_mb: u64,
}

/// Resource governance declared by a service package.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceGovernancePolicy {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_in_mb: u64,
    #[serde(default)]
    pub code_packages: Vec<CodePackageGovernance>,
}

impl ResourceGovernancePolicy {
    pub fn is_governed(&self) -> bool {
        self.cpu_cores > 0.0 || self.memory_in_mb > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePackageDescription {
    pub name: String,
    #[serde(default)]
    pub governance: Option<ResourceGovernancePolicy>,
    #[serde(default)]
    pub container_images: Vec<String>,
}

/// Per-metric capacity settings of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetric {
    pub name: String,
    /// Load reserved on each of the application's `min_nodes` nodes.
    #[serde(default)]
    pub reservation_per_node: i64,
    /// Maximum load of the application on one node; 0 means unlimited.
    #[serde(default)]
    pub max_load_per_node: i64,
    /// Maximum total load of the application; 0 means unlimited.
    #[serde(default)]
    pub total_capacity: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationCapacity {
    #[serde(default)]
    pub min_nodes: u32,
    /// Scale-out limit; 0 means unlimited.
    #[serde(default)]
    pub max_nodes: u32,
    #[serde(default)]
    pub metrics: Vec<ApplicationMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    pub name: String,
    #[serde(default)]
    pub capacity: Option<ApplicationCapacity>,
    #[serde(default)]
    pub service_packages: Vec<ServicePackageDescription>,
    #[serde(default)]
    pub upgrade_in_progress: bool,
    #[serde(default)]
    pub completed_upgrade_domains: BTreeSet<String>,
}

impl ApplicationDescription {
    /// App-group applications declare scale-out or capacity and get
    /// their own entry in the application→domain index.
    pub fn is_app_group(&self) -> bool {
        self.capacity
            .as_ref()
            .is_some_and(|c| c.min_nodes > 0 || c.max_nodes > 0 || !c.metrics.is_empty())
    }
}

// ── Failover unit ──────────────────────────────────────────────────

/// Replica role. Stateless instances are reported as `Secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Idle,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    #[default]
    Ready,
    InBuild,
    Dropped,
}

/// Requests attached to a replica by the failover authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaFlags {
    #[serde(default)]
    pub to_be_dropped: bool,
    #[serde(default)]
    pub primary_to_be_swapped_out: bool,
    #[serde(default)]
    pub move_in_progress: bool,
    #[serde(default)]
    pub to_be_promoted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node_id: NodeId,
    pub role: ReplicaRole,
    #[serde(default)]
    pub state: ReplicaState,
    #[serde(default = "default_true")]
    pub is_up: bool,
    #[serde(default)]
    pub flags: ReplicaFlags,
}

fn default_true() -> bool {
    true
}

impl ReplicaDescription {
    pub fn new(node_id: &str, role: ReplicaRole) -> Self {
        Self {
            node_id: node_id.to_string(),
            role,
            state: ReplicaState::Ready,
            is_up: true,
            flags: ReplicaFlags::default(),
        }
    }

    /// Whether the replica counts toward the partition's target size.
    pub fn is_healthy(&self) -> bool {
        self.is_up
            && self.state != ReplicaState::Dropped
            && matches!(self.role, ReplicaRole::Primary | ReplicaRole::Secondary)
            && !self.flags.to_be_dropped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub id: FailoverUnitId,
    pub service_name: String,
    /// Strictly increasing on every accepted update.
    pub version: u64,
    #[serde(default)]
    pub is_in_transition: bool,
    /// Overrides the service's target replica count (instance auto-scaling).
    #[serde(default)]
    pub target_replica_count: Option<u32>,
    #[serde(default)]
    pub replicas: Vec<ReplicaDescription>,
}

impl FailoverUnitDescription {
    pub fn primary(&self) -> Option<&ReplicaDescription> {
        self.replicas
            .iter()
            .find(|r| r.role == ReplicaRole::Primary && r.is_healthy())
    }

    pub fn replica_on(&self, node_id: &str) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.node_id == node_id)
    }

    pub fn healthy_replica_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_healthy()).count()
    }
}

// ── Load reports ───────────────────────────────────────────────────

/// Load and move-cost report for one failover unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadOrMoveCostDescription {
    pub failover_unit_id: FailoverUnitId,
    pub service_name: String,
    pub is_stateful: bool,
    #[serde(default)]
    pub primary_loads: BTreeMap<String, i64>,
    #[serde(default)]
    pub secondary_loads: BTreeMap<String, i64>,
    /// Secondaries (or instances) that report their own load.
    #[serde(default)]
    pub secondary_loads_per_node: BTreeMap<NodeId, BTreeMap<String, i64>>,
    #[serde(default)]
    pub primary_move_cost: Option<MoveCost>,
    #[serde(default)]
    pub secondary_move_cost: Option<MoveCost>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metricless_service_gets_count_metrics() {
        let svc = ServiceDescription {
            name: "fabric:/app/svc".into(),
            service_type: "T".into(),
            application: None,
            service_package: None,
            is_stateful: true,
            placement_constraints: String::new(),
            affinity: None,
            metrics: vec![],
            default_move_cost: MoveCost::Low,
            partition_count: 1,
            target_replica_set_size: 3,
            auto_scaling_policies: vec![],
        };
        let names: Vec<String> = svc.effective_metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec![PRIMARY_COUNT_METRIC, REPLICA_COUNT_METRIC, COUNT_METRIC]);
    }

    #[test]
    fn app_group_requires_capacity_settings() {
        let mut app = ApplicationDescription {
            name: "fabric:/app".into(),
            capacity: Some(ApplicationCapacity::default()),
            service_packages: vec![],
            upgrade_in_progress: false,
            completed_upgrade_domains: BTreeSet::new(),
        };
        assert!(!app.is_app_group());
        app.capacity = Some(ApplicationCapacity {
            min_nodes: 0,
            max_nodes: 3,
            metrics: vec![],
        });
        assert!(app.is_app_group());
    }

    #[test]
    fn dropped_and_down_replicas_are_not_healthy() {
        let mut r = ReplicaDescription::new("N1", ReplicaRole::Secondary);
        assert!(r.is_healthy());
        r.is_up = false;
        assert!(!r.is_healthy());
        r.is_up = true;
        r.state = ReplicaState::Dropped;
        assert!(!r.is_healthy());
        let standby = ReplicaDescription::new("N1", ReplicaRole::Standby);
        assert!(!standby.is_healthy());
    }

    #[test]
    fn parse_node_from_json() {
        let json = r#"{"node_id":"N1","capacities":{"CPU":4},"is_up":true}"#;
        let node: NodeDescription = serde_json::from_str(json).unwrap();
        assert_eq!(node.capacities["CPU"], 4);
        assert!(node.accepts_replicas());
    }
}
