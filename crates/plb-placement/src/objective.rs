//! Balancing objective.
//!
//! The score of a placement is the weighted sum, over the domain's metrics,
//! of the standard deviation of per-node load. Loads are normalised by node
//! capacity when every eligible node declares one for the metric. A
//! defragmentation metric contributes `w × (0.5 − σ)` instead, so packing
//! lowers the score. Lower is better.

use std::collections::BTreeSet;

use plb_core::{MoveCost, PlbConfig};
use plb_model::DomainSnapshot;

use crate::state::PlacementState;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricTerm {
    pub name: String,
    pub weight: f64,
    pub defragmentation: bool,
    pub balancing_threshold: f64,
    pub activity_threshold: i64,
    pub empty_node_target: u32,
}

/// Load distribution of one metric over the eligible nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricStats {
    pub metric: String,
    pub node_count: usize,
    pub min_load: i64,
    pub max_load: i64,
    pub average_load: f64,
    /// Standard deviation of the (normalised) node load.
    pub deviation: f64,
    pub empty_nodes: usize,
}

#[derive(Debug, Clone)]
pub struct Objective {
    terms: Vec<MetricTerm>,
    move_cost_weight: f64,
    swap_cost: f64,
}

impl Objective {
    pub fn new(snapshot: &DomainSnapshot, config: &PlbConfig) -> Self {
        let terms = snapshot
            .metrics
            .iter()
            .filter_map(|metric| {
                let weights: Vec<f64> = snapshot
                    .services
                    .values()
                    .filter_map(|s| s.metric(metric))
                    .map(|m| m.weight)
                    .collect();
                let service_weight = if weights.is_empty() {
                    1.0
                } else {
                    weights.iter().sum::<f64>() / weights.len() as f64
                };
                let weight = config.global_weight(metric) * service_weight;
                (weight > 0.0).then(|| MetricTerm {
                    name: metric.clone(),
                    weight,
                    defragmentation: config.is_defragmentation_metric(metric),
                    balancing_threshold: config.balancing_threshold(metric),
                    activity_threshold: config.activity_threshold(metric),
                    empty_node_target: config.empty_node_threshold(metric),
                })
            })
            .collect();
        Self {
            terms,
            move_cost_weight: config.move_cost_weight,
            swap_cost: config.swap_cost,
        }
    }

    pub fn terms(&self) -> &[MetricTerm] {
        &self.terms
    }

    pub fn score(&self, state: &PlacementState) -> f64 {
        self.terms
            .iter()
            .map(|term| {
                let sigma = self.stats(state, term).deviation;
                if term.defragmentation {
                    term.weight * (0.5 - sigma)
                } else {
                    term.weight * sigma
                }
            })
            .sum()
    }

    pub fn move_penalty(&self, config: &PlbConfig, cost: MoveCost) -> f64 {
        self.move_cost_weight * f64::from(config.move_cost_value(cost))
    }

    pub fn swap_penalty(&self) -> f64 {
        self.move_cost_weight * self.swap_cost
    }

    pub fn stats(&self, state: &PlacementState, term: &MetricTerm) -> MetricStats {
        let nodes: Vec<usize> = (0..state.node_count())
            .filter(|n| state.is_node_eligible(*n))
            .collect();
        let loads: Vec<i64> = nodes.iter().map(|n| state.node_load(*n, &term.name)).collect();
        let capacities: Option<Vec<i64>> = nodes
            .iter()
            .map(|n| state.node(*n).capacity(&term.name).filter(|c| *c > 0))
            .collect();
        let values: Vec<f64> = match &capacities {
            Some(caps) => loads.iter().zip(caps).map(|(l, c)| *l as f64 / *c as f64).collect(),
            None => loads.iter().map(|l| *l as f64).collect(),
        };

        let count = values.len();
        let deviation = if count == 0 {
            0.0
        } else {
            let mean = values.iter().sum::<f64>() / count as f64;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            variance.sqrt()
        };
        MetricStats {
            metric: term.name.clone(),
            node_count: count,
            min_load: loads.iter().copied().min().unwrap_or(0),
            max_load: loads.iter().copied().max().unwrap_or(0),
            average_load: if count == 0 {
                0.0
            } else {
                loads.iter().sum::<i64>() as f64 / count as f64
            },
            deviation,
            empty_nodes: loads.iter().filter(|l| **l == 0).count(),
        }
    }

    /// Whether a metric needs balancing (or, for defragmentation metrics,
    /// packing) given its current distribution.
    pub fn needs_balancing(term: &MetricTerm, stats: &MetricStats) -> bool {
        if stats.node_count < 2 {
            return false;
        }
        if term.defragmentation {
            let occupied = stats.node_count - stats.empty_nodes;
            return stats.empty_nodes < term.empty_node_target as usize && occupied >= 2;
        }
        if stats.max_load <= 0 || stats.max_load < term.activity_threshold {
            return false;
        }
        stats.min_load <= 0 || stats.max_load as f64 / stats.min_load as f64 > term.balancing_threshold
    }

    /// Metrics needing balancing and the nodes overloaded in any of them.
    pub fn analyze(&self, state: &PlacementState) -> BalanceAnalysis {
        let mut analysis = BalanceAnalysis::default();
        for term in &self.terms {
            let stats = self.stats(state, term);
            if !Self::needs_balancing(term, &stats) {
                continue;
            }
            analysis.imbalanced_metrics.push(term.name.clone());
            if term.defragmentation {
                continue;
            }
            let limit = stats.average_load * term.balancing_threshold;
            for node in (0..state.node_count()).filter(|n| state.is_node_eligible(*n)) {
                if state.node_load(node, &term.name) as f64 > limit {
                    analysis.overloaded_nodes.insert(node);
                }
            }
        }
        analysis
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BalanceAnalysis {
    pub imbalanced_metrics: Vec<String>,
    pub overloaded_nodes: BTreeSet<usize>,
}

impl BalanceAnalysis {
    pub fn is_balanced(&self) -> bool {
        self.imbalanced_metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use plb_core::ReplicaRole;

    use super::*;
    use crate::state::tests::SnapshotBuilder;

    #[test]
    fn deviation_uses_normalised_load() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[("CPU", 4)])
            .node("N2", "fd:/2", &[("CPU", 8)])
            .service(1, false, 1, &[("CPU", 2, 2)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N2", ReplicaRole::Secondary)])
            .failover_unit(3, 1, &[("N2", ReplicaRole::Secondary)])
            .build();
        let config = PlbConfig::default();
        let state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        let stats = objective.stats(&state, &objective.terms()[0]);
        // 2/4 and 4/8: perfectly balanced relative to capacity.
        assert!(stats.deviation.abs() < 1e-12);
        assert_eq!(stats.max_load, 4);
        assert_eq!(stats.min_load, 2);
    }

    #[test]
    fn imbalance_respects_thresholds() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .service(1, false, 1, &[("CPU", 3, 3)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(3, 1, &[("N2", ReplicaRole::Secondary)])
            .build();
        let mut config = PlbConfig::default();
        let state = PlacementState::new(&snapshot, &config);
        let analysis = Objective::new(&snapshot, &config).analyze(&state);
        assert_eq!(analysis.imbalanced_metrics, vec!["CPU".to_string()]);
        assert_eq!(analysis.overloaded_nodes, BTreeSet::from([0]));

        config.metric_balancing_thresholds.insert("CPU".into(), 2.0);
        let state = PlacementState::new(&snapshot, &config);
        assert!(Objective::new(&snapshot, &config).analyze(&state).is_balanced());

        config.metric_balancing_thresholds.clear();
        config.metric_activity_thresholds.insert("CPU".into(), 10);
        let state = PlacementState::new(&snapshot, &config);
        assert!(Objective::new(&snapshot, &config).analyze(&state).is_balanced());
    }

    #[test]
    fn defragmentation_prefers_packing() {
        let snapshot = SnapshotBuilder::new()
            .node("N1", "fd:/1", &[])
            .node("N2", "fd:/2", &[])
            .node("N3", "fd:/3", &[])
            .service(1, false, 1, &[("Disk", 1, 1)])
            .failover_unit(1, 1, &[("N1", ReplicaRole::Secondary)])
            .failover_unit(2, 1, &[("N2", ReplicaRole::Secondary)])
            .build();
        let mut config = PlbConfig::default();
        config.defragmentation_metrics.insert("Disk".into(), true);
        let mut state = PlacementState::new(&snapshot, &config);
        let objective = Objective::new(&snapshot, &config);
        assert!(!objective.analyze(&state).is_balanced());

        let spread = objective.score(&state);
        state.move_replica(1, 1, 0);
        assert!(objective.score(&state) < spread);
        assert!(objective.analyze(&state).is_balanced());
    }
}
