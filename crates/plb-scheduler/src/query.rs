//! Read-only load and placement queries.

use std::collections::BTreeMap;

use plb_core::{NodeId, ReplicaRole};
use plb_placement::{Objective, PlacementState, UnplacedReport};

use crate::engine::PlacementAndLoadBalancer;
use crate::error::{SchedulerError, SchedulerResult};

/// Balancing state of one metric across the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLoadInformation {
    pub name: String,
    pub is_balanced: bool,
    /// Standard deviation of the per-node (normalised) load.
    pub deviation: f64,
    pub balancing_threshold: f64,
    pub activity_threshold: i64,
    pub is_defragmentation: bool,
    pub min_node_load: i64,
    pub max_node_load: i64,
    pub average_node_load: f64,
    /// Sum of the capacities of up nodes that declare one.
    pub cluster_capacity: i64,
    pub cluster_load: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterLoadInformation {
    /// Ascending by metric name.
    pub metrics: Vec<MetricLoadInformation>,
}

impl ClusterLoadInformation {
    pub fn metric(&self, name: &str) -> Option<&MetricLoadInformation> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetricInformation {
    pub name: String,
    pub capacity: Option<i64>,
    pub load: i64,
    pub remaining_capacity: Option<i64>,
    /// Capacity minus the configured node buffer.
    pub buffered_capacity: Option<i64>,
    pub remaining_buffered_capacity: Option<i64>,
    pub is_capacity_violated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeLoadInformation {
    pub node_id: NodeId,
    pub metrics: Vec<NodeMetricInformation>,
}

impl NodeLoadInformation {
    pub fn metric(&self, name: &str) -> Option<&NodeMetricInformation> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMetricInformation {
    pub name: String,
    /// Reservation per node times the minimum node count.
    pub reserved_capacity: i64,
    pub total_capacity: i64,
    pub load: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationLoadInformation {
    pub name: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub node_count: usize,
    pub metrics: Vec<ApplicationMetricInformation>,
}

impl PlacementAndLoadBalancer {
    pub fn cluster_load_information(&self) -> ClusterLoadInformation {
        let config = self.config.read().clone();
        let model = self.model.read();
        let mut metrics = BTreeMap::new();
        for domain in model.domain_ids() {
            let Some(snapshot) = model.snapshot(domain) else {
                continue;
            };
            let state = PlacementState::new(&snapshot, &config);
            let objective = Objective::new(&snapshot, &config);
            for term in objective.terms() {
                let stats = objective.stats(&state, term);
                let mut cluster_capacity = 0;
                let mut cluster_load = 0;
                for node in 0..state.node_count() {
                    cluster_load += state.node_load(node, &term.name);
                    if state.node(node).is_up {
                        cluster_capacity += state.node(node).capacity(&term.name).unwrap_or(0);
                    }
                }
                metrics.insert(
                    term.name.clone(),
                    MetricLoadInformation {
                        name: term.name.clone(),
                        is_balanced: !Objective::needs_balancing(term, &stats),
                        deviation: stats.deviation,
                        balancing_threshold: term.balancing_threshold,
                        activity_threshold: term.activity_threshold,
                        is_defragmentation: term.defragmentation,
                        min_node_load: stats.min_load,
                        max_node_load: stats.max_load,
                        average_node_load: stats.average_load,
                        cluster_capacity,
                        cluster_load,
                    },
                );
            }
        }
        ClusterLoadInformation {
            metrics: metrics.into_values().collect(),
        }
    }

    pub fn node_load_information(&self, node_id: &str) -> SchedulerResult<NodeLoadInformation> {
        let config = self.config.read().clone();
        let model = self.model.read();
        if model.node(node_id).is_none() {
            return Err(SchedulerError::NodeNotFound(node_id.to_string()));
        }
        let mut metrics = BTreeMap::new();
        for domain in model.domain_ids() {
            let Some(snapshot) = model.snapshot(domain) else {
                continue;
            };
            let state = PlacementState::new(&snapshot, &config);
            let Some(node) = state.node_index(node_id) else {
                continue;
            };
            for metric in &snapshot.metrics {
                let capacity = state.node(node).capacity(metric);
                let load = state.node_load(node, metric);
                let buffered = capacity.map(|c| (c as f64 * (1.0 - config.node_buffer(metric))).floor() as i64);
                metrics.insert(
                    metric.clone(),
                    NodeMetricInformation {
                        name: metric.clone(),
                        capacity,
                        load,
                        remaining_capacity: capacity.map(|c| (c - load).max(0)),
                        buffered_capacity: buffered,
                        remaining_buffered_capacity: buffered.map(|c| (c - load).max(0)),
                        is_capacity_violated: capacity.is_some_and(|c| load > c),
                    },
                );
            }
        }
        Ok(NodeLoadInformation {
            node_id: node_id.to_string(),
            metrics: metrics.into_values().collect(),
        })
    }

    pub fn application_load_information(&self, name: &str) -> SchedulerResult<ApplicationLoadInformation> {
        let config = self.config.read().clone();
        let model = self.model.read();
        let app = model
            .application(name)
            .ok_or_else(|| SchedulerError::ApplicationNotFound(name.to_string()))?;
        let capacity = app.description.capacity.clone().unwrap_or_default();

        let snapshot = model
            .domain_of_application(name)
            .and_then(|domain| model.snapshot(domain));
        let state = snapshot.as_ref().map(|s| PlacementState::new(s, &config));

        let metrics = capacity
            .metrics
            .iter()
            .map(|metric| ApplicationMetricInformation {
                name: metric.name.clone(),
                reserved_capacity: metric.reservation_per_node * i64::from(capacity.min_nodes),
                total_capacity: metric.total_capacity,
                load: state
                    .as_ref()
                    .map_or(0, |s| s.app_total_load(app.id, &metric.name)),
            })
            .collect();
        Ok(ApplicationLoadInformation {
            name: name.to_string(),
            min_nodes: capacity.min_nodes,
            max_nodes: capacity.max_nodes,
            node_count: state.as_ref().map_or(0, |s| s.app_node_count(app.id)),
            metrics,
        })
    }

    /// Why replicas of `service` could not be placed in the last placement pass.
    pub fn unplaced_replica_information(&self, service: &str) -> SchedulerResult<Vec<UnplacedReport>> {
        if self.with_model(|m| m.service(service).is_none()) {
            return Err(SchedulerError::ServiceNotFound(service.to_string()));
        }
        Ok(self
            .state
            .lock()
            .unplaced
            .values()
            .flatten()
            .filter(|r| r.service_name == service)
            .cloned()
            .collect())
    }
}

/// One line per unplaced replica, e.g.
/// `fabric:/svc 0000...0001 Secondary: Capacity x2, FaultDomain x1`.
pub fn describe_unplaced(report: &UnplacedReport) -> String {
    let role = match report.role {
        ReplicaRole::Primary => "Primary",
        ReplicaRole::Secondary => "Secondary",
        ReplicaRole::Idle => "Idle",
        ReplicaRole::Standby => "Standby",
    };
    let reasons: Vec<String> = report
        .reasons
        .iter()
        .map(|(reason, nodes)| format!("{reason} x{nodes}"))
        .collect();
    format!(
        "{} {} {}: {}",
        report.service_name,
        report.failover_unit_id,
        role,
        reasons.join(", ")
    )
}
