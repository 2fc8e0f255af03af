//! Service domains: independently scheduled slices of the cluster model.
//!
//! A domain owns the services, app-group applications and failover units
//! that transitively share a load metric (or an affinity / application
//! relationship). Domains only ever merge; they are torn down when their
//! last service or application leaves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use plb_core::{FailoverUnitId, NodeId};

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(ServiceId, "svc#");
arena_id!(ApplicationId, "app#");
arena_id!(ServicePackageId, "pkg#");
arena_id!(DomainId, "domain#");

/// Reserved capacity bookkeeping for the app-group applications of a domain.
///
/// `total_reserved` is what applications asked for (`reservation × min_nodes`);
/// `used` is the part of that reservation already covered by real load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationLedger {
    total_reserved: BTreeMap<String, i64>,
    used: BTreeMap<String, i64>,
    contributions: BTreeMap<ApplicationId, AppContribution>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AppContribution {
    reserved: BTreeMap<String, i64>,
    used: BTreeMap<String, i64>,
}

impl ReservationLedger {
    pub fn total_reserved(&self, metric: &str) -> i64 {
        self.total_reserved.get(metric).copied().unwrap_or(0)
    }

    pub fn reserved_load_used(&self, metric: &str) -> i64 {
        self.used.get(metric).copied().unwrap_or(0)
    }

    pub fn metrics(&self) -> impl Iterator<Item = &String> {
        self.total_reserved.keys()
    }

    /// Replace the reservation an application asks for.
    pub fn set_reserved(&mut self, app: ApplicationId, reserved: BTreeMap<String, i64>) {
        let entry = self.contributions.entry(app).or_default();
        let old = std::mem::replace(&mut entry.reserved, reserved.clone());
        apply_delta(&mut self.total_reserved, &old, &reserved, "total reserved capacity");
    }

    /// Replace the portion of an application's reservation covered by load.
    pub fn set_used(&mut self, app: ApplicationId, used: BTreeMap<String, i64>) {
        let entry = self.contributions.entry(app).or_default();
        let old = std::mem::replace(&mut entry.used, used.clone());
        apply_delta(&mut self.used, &old, &used, "reserved load used");
    }

    /// Drop everything an application contributed.
    pub fn remove(&mut self, app: ApplicationId) {
        if let Some(old) = self.contributions.remove(&app) {
            apply_delta(&mut self.total_reserved, &old.reserved, &BTreeMap::new(), "total reserved capacity");
            apply_delta(&mut self.used, &old.used, &BTreeMap::new(), "reserved load used");
        }
    }

    /// Move all contributions of `other` into this ledger.
    pub fn absorb(&mut self, other: ReservationLedger) {
        for (app, contribution) in other.contributions {
            self.set_reserved(app, contribution.reserved);
            self.set_used(app, contribution.used);
        }
    }
}

/// Subtract `old` and add `new` to `totals`. A total below zero is a
/// bookkeeping bug and aborts.
fn apply_delta(
    totals: &mut BTreeMap<String, i64>,
    old: &BTreeMap<String, i64>,
    new: &BTreeMap<String, i64>,
    what: &str,
) {
    for (metric, value) in old {
        let total = totals.entry(metric.clone()).or_insert(0);
        *total -= value;
        assert!(*total >= 0, "{what} for metric {metric} went negative ({total})");
    }
    for (metric, value) in new {
        assert!(*value >= 0, "{what} contribution for metric {metric} is negative ({value})");
        *totals.entry(metric.clone()).or_insert(0) += value;
    }
    totals.retain(|_, v| *v != 0);
}

/// An independently scheduled group of services.
#[derive(Debug, Clone)]
pub struct ServiceDomain {
    pub id: DomainId,
    pub services: BTreeSet<ServiceId>,
    /// App-group applications owned by this domain.
    pub applications: BTreeSet<ApplicationId>,
    /// Metric name → number of services and applications using it.
    pub metrics: BTreeMap<String, usize>,
    pub failover_units: BTreeSet<FailoverUnitId>,
    /// Healthy replicas per node.
    pub node_replica_counts: BTreeMap<NodeId, u32>,
    /// Replicas being built per node.
    pub node_in_build_counts: BTreeMap<NodeId, u32>,
    pub reservation: ReservationLedger,
    /// Bumped on every mutation that touches the domain. A refresh computed
    /// against an older generation is abandoned.
    pub generation: u64,
    /// Bumped on every applied load report, including those that leave
    /// the generation alone.
    pub load_stamp: u64,
}

impl ServiceDomain {
    pub fn new(id: DomainId) -> Self {
        Self {
            id,
            services: BTreeSet::new(),
            applications: BTreeSet::new(),
            metrics: BTreeMap::new(),
            failover_units: BTreeSet::new(),
            node_replica_counts: BTreeMap::new(),
            node_in_build_counts: BTreeMap::new(),
            reservation: ReservationLedger::default(),
            generation: 0,
            load_stamp: 0,
        }
    }

    /// Services plus app-group applications; zero means the domain is dead.
    pub fn entity_count(&self) -> usize {
        self.services.len() + self.applications.len()
    }

    pub fn add_metric(&mut self, metric: &str) {
        *self.metrics.entry(metric.to_string()).or_insert(0) += 1;
    }

    /// Returns true when no user of the metric is left.
    pub fn release_metric(&mut self, metric: &str) -> bool {
        match self.metrics.get_mut(metric) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.metrics.remove(metric);
                true
            }
            None => panic!("domain {} released unknown metric {metric}", self.id),
        }
    }

    pub(crate) fn add_counts(&mut self, healthy: &[NodeId], in_build: &[NodeId]) {
        for node in healthy {
            *self.node_replica_counts.entry(node.clone()).or_insert(0) += 1;
        }
        for node in in_build {
            *self.node_in_build_counts.entry(node.clone()).or_insert(0) += 1;
        }
    }

    pub(crate) fn remove_counts(&mut self, healthy: &[NodeId], in_build: &[NodeId]) {
        decrement(&mut self.node_replica_counts, healthy, self.id);
        decrement(&mut self.node_in_build_counts, in_build, self.id);
    }

    /// Fold another domain into this one.
    pub(crate) fn absorb(&mut self, other: ServiceDomain) {
        self.services.extend(other.services);
        self.applications.extend(other.applications);
        for (metric, count) in other.metrics {
            *self.metrics.entry(metric).or_insert(0) += count;
        }
        self.failover_units.extend(other.failover_units);
        for (node, count) in other.node_replica_counts {
            *self.node_replica_counts.entry(node).or_insert(0) += count;
        }
        for (node, count) in other.node_in_build_counts {
            *self.node_in_build_counts.entry(node).or_insert(0) += count;
        }
        self.reservation.absorb(other.reservation);
        self.generation += 1;
        self.load_stamp = self.load_stamp.max(other.load_stamp) + 1;
    }
}

fn decrement(counts: &mut BTreeMap<NodeId, u32>, nodes: &[NodeId], domain: DomainId) {
    for node in nodes {
        match counts.get_mut(node) {
            Some(c) if *c > 1 => *c -= 1,
            Some(_) => {
                counts.remove(node);
            }
            None => panic!("{domain}: replica counter for node {node} went negative"),
        }
    }
}
