//! Cluster seed files.
//!
//! A seed is a JSON document holding the initial cluster state the daemon
//! feeds into the engine before the first refresh, in dependency order:
//! nodes, service types, applications, services, failover units, loads.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use plb_core::{
    ApplicationDescription, FailoverUnitDescription, LoadOrMoveCostDescription, NodeDescription,
    ServiceDescription, ServiceTypeDescription,
};
use plb_scheduler::PlacementAndLoadBalancer;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSeed {
    pub nodes: Vec<NodeDescription>,
    pub service_types: Vec<ServiceTypeDescription>,
    pub applications: Vec<ApplicationDescription>,
    pub services: Vec<ServiceDescription>,
    pub failover_units: Vec<FailoverUnitDescription>,
    pub loads: Vec<LoadOrMoveCostDescription>,
}

impl ClusterSeed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cluster seed {}", path.display()))?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> anyhow::Result<Self> {
        serde_json::from_str(content).context("failed to parse cluster seed")
    }

    /// Push the seed into the engine. Services are applied without force,
    /// so invalid constraints or scaling policies fail the load.
    pub fn apply(self, engine: &PlacementAndLoadBalancer) -> anyhow::Result<()> {
        let counts = (
            self.nodes.len(),
            self.services.len(),
            self.failover_units.len(),
        );
        for node in self.nodes {
            let id = node.node_id.clone();
            engine.update_node(node).with_context(|| format!("node {id}"))?;
        }
        for service_type in self.service_types {
            engine.update_service_type(service_type);
        }
        for application in self.applications {
            let name = application.name.clone();
            engine
                .update_application(application, false)
                .with_context(|| format!("application {name}"))?;
        }
        for service in self.services {
            let name = service.name.clone();
            engine
                .update_service(service, false)
                .with_context(|| format!("service {name}"))?;
        }
        for fu in self.failover_units {
            let id = fu.id;
            engine
                .update_failover_unit(fu)
                .with_context(|| format!("failover unit {id}"))?;
        }
        for load in &self.loads {
            engine.update_load_or_move_cost(load);
        }
        info!(
            nodes = counts.0,
            services = counts.1,
            failover_units = counts.2,
            "cluster seed applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use plb_core::{ActionKind, PlbConfig};
    use plb_scheduler::RecordingAuthority;

    use super::*;

    const SAMPLE: &str = include_str!("../cluster.json");

    #[test]
    fn sample_seed_places_missing_replicas() {
        let seed = ClusterSeed::from_json_str(SAMPLE).unwrap();
        assert_eq!(seed.nodes.len(), 3);

        let authority = Arc::new(RecordingAuthority::new());
        let engine = PlacementAndLoadBalancer::new(PlbConfig::default(), authority.clone());
        seed.apply(&engine).unwrap();

        let report = engine.refresh(Instant::now());
        let movement = &report.emitted[&uuid::Uuid::from_u128(2)];
        assert_eq!(movement.actions.len(), 1);
        assert_eq!(movement.actions[0].kind, ActionKind::AddSecondary);
        assert_eq!(authority.movements().len(), report.emitted.len());
    }

    #[test]
    fn unknown_service_type_fails_the_load() {
        let seed = ClusterSeed::from_json_str(
            r#"{
                "nodes": [{ "node_id": "N1", "is_up": true }],
                "services": [{
                    "name": "fabric:/svc",
                    "service_type": "Missing",
                    "is_stateful": false,
                    "target_replica_set_size": 1
                }]
            }"#,
        )
        .unwrap();
        let engine = PlacementAndLoadBalancer::new(PlbConfig::default(), Arc::new(RecordingAuthority::new()));
        let err = seed.apply(&engine).unwrap_err();
        assert!(err.to_string().contains("fabric:/svc"));
    }
}
