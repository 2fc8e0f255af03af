//! Prometheus text exposition format.
//!
//! Renders a statistics snapshot for scraping by a Prometheus server or
//! compatible agent.

use std::collections::BTreeMap;

use crate::aggregator::PlbStatistics;

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn labelled_counter(out: &mut String, name: &str, help: &str, label: &str, values: &BTreeMap<String, u64>) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (key, value) in values {
        out.push_str(&format!("{name}{{{label}=\"{key}\"}} {value}\n"));
    }
}

/// Render a statistics snapshot into Prometheus text format.
pub fn render_prometheus(stats: &PlbStatistics) -> String {
    let mut out = String::new();
    let g = &stats.gauges;

    gauge(&mut out, "plb_nodes", "Nodes known to the engine.", g.nodes);
    gauge(&mut out, "plb_nodes_up", "Nodes that are up.", g.up_nodes);
    gauge(&mut out, "plb_services", "Services known to the engine.", g.services);
    gauge(&mut out, "plb_failover_units", "Failover units known to the engine.", g.failover_units);
    gauge(&mut out, "plb_service_domains", "Independently scheduled service domains.", g.domains);
    gauge(
        &mut out,
        "plb_rg_service_packages",
        "Service packages with a resource governance policy.",
        g.governed_service_packages,
    );
    gauge(&mut out, "plb_rg_cpu_cores_used", "Governed CPU cores in use.", format!("{:.3}", g.cpu_cores_used));
    gauge(
        &mut out,
        "plb_rg_cpu_cores_capacity",
        "Governed CPU core capacity.",
        format!("{:.3}", g.cpu_cores_capacity),
    );
    gauge(&mut out, "plb_rg_memory_mb_used", "Governed memory in use, in MB.", g.memory_in_mb_used);
    gauge(&mut out, "plb_rg_memory_mb_capacity", "Governed memory capacity, in MB.", g.memory_in_mb_capacity);
    gauge(
        &mut out,
        "plb_defragmentation_metrics",
        "Metrics scheduled for defragmentation.",
        g.defragmentation_metrics,
    );
    gauge(
        &mut out,
        "plb_autoscale_partition_services",
        "Services auto-scaled by partition count.",
        g.partition_scaled_services,
    );
    gauge(
        &mut out,
        "plb_autoscale_instance_services",
        "Services auto-scaled by instance count.",
        g.instance_scaled_services,
    );
    gauge(
        &mut out,
        "plb_autoscale_pending_repartitions",
        "Repartitions proposed and not consumed yet.",
        g.pending_repartitions,
    );
    gauge(&mut out, "plb_unplaced_replicas", "Replicas no node can host.", g.unplaced_replicas);

    out.push_str("# HELP plb_refreshes_total Refresh passes run.\n");
    out.push_str("# TYPE plb_refreshes_total counter\n");
    out.push_str(&format!("plb_refreshes_total {}\n", stats.refreshes));
    out.push_str("# HELP plb_abandoned_domain_passes_total Domain passes abandoned on a concurrent update.\n");
    out.push_str("# TYPE plb_abandoned_domain_passes_total counter\n");
    out.push_str(&format!("plb_abandoned_domain_passes_total {}\n", stats.abandoned_refreshes));
    out.push_str("# HELP plb_repartition_failures_total Repartitions the authority reported as failed.\n");
    out.push_str("# TYPE plb_repartition_failures_total counter\n");
    out.push_str(&format!("plb_repartition_failures_total {}\n", stats.repartition_failures));

    labelled_counter(
        &mut out,
        "plb_movements_total",
        "Emitted movements by scheduler action.",
        "scheduler_action",
        &stats.movements,
    );
    labelled_counter(&mut out, "plb_actions_total", "Emitted replica actions by kind.", "kind", &stats.actions);
    labelled_counter(
        &mut out,
        "plb_dropped_movements_total",
        "Dropped movements by reason.",
        "reason",
        &stats.drops,
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ClusterGauges;

    #[test]
    fn render_empty() {
        let output = render_prometheus(&PlbStatistics::default());
        assert!(output.contains("plb_nodes 0\n"));
        assert!(output.contains("# TYPE plb_movements_total counter"));
        assert!(!output.contains("plb_movements_total{"));
    }

    #[test]
    fn render_labelled_counters() {
        let mut stats = PlbStatistics {
            gauges: ClusterGauges {
                nodes: 5,
                cpu_cores_used: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        stats.movements.insert("LoadBalancing".into(), 7);
        stats.drops.insert("VersionMismatch".into(), 2);
        let output = render_prometheus(&stats);
        assert!(output.contains("plb_nodes 5\n"));
        assert!(output.contains("plb_rg_cpu_cores_used 1.500\n"));
        assert!(output.contains("plb_movements_total{scheduler_action=\"LoadBalancing\"} 7\n"));
        assert!(output.contains("plb_dropped_movements_total{reason=\"VersionMismatch\"} 2\n"));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&PlbStatistics::default());
        for line in output.lines() {
            assert!(
                line.starts_with("# HELP ") || line.starts_with("# TYPE ") || line.starts_with("plb_"),
                "unexpected line: {line}"
            );
        }
    }
}
