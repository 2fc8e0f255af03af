//! ClusterModel: the versioned, in-memory view of the cluster.
//!
//! Owns arena-style tables keyed by opaque integer ids and keeps the
//! service-domain indices (`metric → domain`, `service → domain`,
//! `application → domain`, service package tables) consistent on every
//! upsert and delete. Cross references are id lookups only.
//!
//! The model itself is not synchronized; the engine wraps it in a
//! reader/writer lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use plb_core::*;

use crate::domain::*;
use crate::error::{ModelError, ModelResult};
use crate::snapshot::*;

/// Stored state of a service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub description: ServiceDescription,
    pub application: Option<ApplicationId>,
    pub service_package: Option<ServicePackageId>,
    /// Declared (or implicit count) metrics plus governance metrics.
    pub metrics: Vec<ServiceMetric>,
    pub failover_units: BTreeSet<FailoverUnitId>,
}

#[derive(Debug, Clone)]
pub struct ApplicationEntry {
    pub id: ApplicationId,
    pub description: ApplicationDescription,
    pub services: BTreeSet<ServiceId>,
    pub service_packages: BTreeSet<ServicePackageId>,
    /// Capacity metrics registered in the domain while the app is app-group.
    registered_metrics: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServicePackageEntry {
    pub id: ServicePackageId,
    pub application: ApplicationId,
    pub description: ServicePackageDescription,
}

#[derive(Debug, Clone)]
pub struct FailoverUnitEntry {
    pub description: FailoverUnitDescription,
    pub service: ServiceId,
    pub loads: LoadTable,
}

impl FailoverUnitEntry {
    fn healthy_nodes(&self) -> Vec<NodeId> {
        self.description
            .replicas
            .iter()
            .filter(|r| r.is_healthy())
            .map(|r| r.node_id.clone())
            .collect()
    }

    fn in_build_nodes(&self) -> Vec<NodeId> {
        self.description
            .replicas
            .iter()
            .filter(|r| r.is_up && r.state == ReplicaState::InBuild)
            .map(|r| r.node_id.clone())
            .collect()
    }
}

/// Outcome of a failover unit upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverUnitUpdate {
    Inserted,
    Updated { previous_version: u64 },
    /// Same version and content as stored.
    Unchanged,
}

/// How a node changed on `update_node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    Added,
    WentDown,
    CameUp,
    Changed,
    Unchanged,
}

/// Result of an application upsert.
#[derive(Debug, Clone)]
pub struct ApplicationUpdate {
    pub id: ApplicationId,
    pub previous: Option<ApplicationDescription>,
}

#[derive(Debug, Default)]
pub struct ClusterModel {
    nodes: BTreeMap<NodeId, NodeDescription>,
    node_images: BTreeMap<NodeId, BTreeSet<String>>,
    service_types: BTreeMap<String, ServiceTypeDescription>,
    services: HashMap<ServiceId, ServiceEntry>,
    service_ids: HashMap<String, ServiceId>,
    applications: HashMap<ApplicationId, ApplicationEntry>,
    application_ids: HashMap<String, ApplicationId>,
    service_package_table: HashMap<ServicePackageId, ServicePackageEntry>,
    service_package_ids: HashMap<(ApplicationId, String), ServicePackageId>,
    failover_units: BTreeMap<FailoverUnitId, FailoverUnitEntry>,
    domains: BTreeMap<DomainId, ServiceDomain>,
    metric_to_domain: HashMap<String, DomainId>,
    service_to_domain: HashMap<ServiceId, DomainId>,
    application_to_domain: HashMap<ApplicationId, DomainId>,
    cluster_upgrade_in_progress: bool,
    completed_upgrade_domains: BTreeSet<String>,
    next_id: u64,
}

impl ClusterModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ── Nodes ──────────────────────────────────────────────────────

    pub fn update_node(&mut self, node: NodeDescription) -> ModelResult<NodeChange> {
        if node.node_id.is_empty() {
            return Err(ModelError::InvalidDescription("node id is empty".into()));
        }
        if let Some((metric, value)) = node.capacities.iter().find(|(_, v)| **v < 0) {
            return Err(ModelError::NegativeCapacity {
                node: node.node_id.clone(),
                metric: metric.clone(),
                value: *value,
            });
        }

        let change = match self.nodes.get(&node.node_id) {
            None => NodeChange::Added,
            Some(old) if old == &node => NodeChange::Unchanged,
            Some(old) if old.is_up && !node.is_up => NodeChange::WentDown,
            Some(old) if !old.is_up && node.is_up => NodeChange::CameUp,
            Some(_) => NodeChange::Changed,
        };
        if change == NodeChange::Unchanged {
            return Ok(change);
        }

        debug!(node = %node.node_id, ?change, up = node.is_up, "node updated");
        self.nodes.insert(node.node_id.clone(), node);
        self.bump_all_generations();
        Ok(change)
    }

    pub fn update_available_images(&mut self, node_id: &str, images: BTreeSet<String>) {
        let changed = self.node_images.get(node_id) != Some(&images);
        if changed {
            debug!(node = %node_id, count = images.len(), "available images updated");
            self.node_images.insert(node_id.to_string(), images);
            self.bump_all_generations();
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescription> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescription> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ── Service types ──────────────────────────────────────────────

    pub fn update_service_type(&mut self, service_type: ServiceTypeDescription) {
        let name = service_type.name.clone();
        if self.service_types.get(&name) == Some(&service_type) {
            return;
        }
        self.service_types.insert(name.clone(), service_type);
        self.bump_domains_of_type(&name);
        debug!(service_type = %name, "service type updated");
    }

    /// Remove a service type. Services of the type stay; new placements
    /// for them fail until the type returns.
    pub fn delete_service_type(&mut self, name: &str) -> bool {
        let existed = self.service_types.remove(name).is_some();
        if existed {
            self.bump_domains_of_type(name);
            debug!(service_type = %name, "service type deleted");
        }
        existed
    }

    pub fn service_type(&self, name: &str) -> Option<&ServiceTypeDescription> {
        self.service_types.get(name)
    }

    fn bump_domains_of_type(&mut self, type_name: &str) {
        let affected: BTreeSet<DomainId> = self
            .services
            .values()
            .filter(|s| s.description.service_type == type_name)
            .filter_map(|s| self.service_to_domain.get(&s.id).copied())
            .collect();
        for id in affected {
            self.bump_generation(id);
        }
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or replace an application. Unless `force` is set, a capacity
    /// reservation the cluster cannot hold is rejected.
    pub fn update_application(
        &mut self,
        app: ApplicationDescription,
        force: bool,
    ) -> ModelResult<ApplicationUpdate> {
        self.validate_application(&app, force)?;

        let existing = self.application_ids.get(&app.name).copied();
        let id = match existing {
            Some(id) => id,
            None => {
                let id = ApplicationId(self.allocate_id());
                self.application_ids.insert(app.name.clone(), id);
                self.applications.insert(
                    id,
                    ApplicationEntry {
                        id,
                        description: app.clone(),
                        services: BTreeSet::new(),
                        service_packages: BTreeSet::new(),
                        registered_metrics: Vec::new(),
                    },
                );
                id
            }
        };

        self.sync_service_packages(id, &app.service_packages);

        let previous = self
            .applications
            .get_mut(&id)
            .map(|entry| std::mem::replace(&mut entry.description, app.clone()));
        let previous = existing.and(previous);

        if app.is_app_group() {
            self.attach_app_group(id);
        } else if self.application_to_domain.contains_key(&id) {
            self.detach_app_group(id);
        }
        self.refresh_governed_metrics(id);
        self.refresh_app_reservation_use(id);

        let affected: BTreeSet<DomainId> = self.domains_of_application(id);
        for domain in affected {
            self.bump_generation(domain);
        }

        info!(
            application = %app.name,
            app_group = app.is_app_group(),
            upgrading = app.upgrade_in_progress,
            "application updated"
        );
        Ok(ApplicationUpdate { id, previous })
    }

    /// Re-apply the services of an application whose governance metrics no
    /// longer match their package, so domains follow governance changes.
    fn refresh_governed_metrics(&mut self, app: ApplicationId) {
        let Some(entry) = self.applications.get(&app) else {
            return;
        };
        let stale: Vec<ServiceDescription> = entry
            .services
            .iter()
            .filter_map(|id| self.services.get(id))
            .filter(|s| {
                let wanted = self.service_metrics(&s.description, s.service_package);
                !wanted.iter().map(|m| &m.name).eq(s.metrics.iter().map(|m| &m.name))
            })
            .map(|s| s.description.clone())
            .collect();
        for service in stale {
            let name = service.name.clone();
            match self.update_service(service) {
                Ok(_) => debug!(service = %name, "governed metrics refreshed"),
                Err(e) => warn!(service = %name, error = %e, "governed metrics not refreshed"),
            }
        }
    }

    fn validate_application(&self, app: &ApplicationDescription, force: bool) -> ModelResult<()> {
        let mut package_names = BTreeSet::new();
        for pkg in &app.service_packages {
            if !package_names.insert(pkg.name.as_str()) {
                return Err(ModelError::InvalidDescription(format!(
                    "duplicate service package {} in {}",
                    pkg.name, app.name
                )));
            }
        }
        if let Some(existing) = self.application_ids.get(&app.name).and_then(|id| self.applications.get(id)) {
            let orphaned = existing
                .services
                .iter()
                .filter_map(|s| self.services.get(s))
                .filter_map(|s| s.description.service_package.as_deref())
                .find(|pkg| !package_names.contains(pkg));
            if let Some(pkg) = orphaned {
                return Err(ModelError::InvalidDescription(format!(
                    "service package {pkg} of {} is still in use",
                    app.name
                )));
            }
        }
        let Some(capacity) = &app.capacity else {
            return Ok(());
        };
        if capacity.max_nodes > 0 && capacity.min_nodes > capacity.max_nodes {
            return Err(ModelError::InvalidDescription(format!(
                "min_nodes {} exceeds max_nodes {} for {}",
                capacity.min_nodes, capacity.max_nodes, app.name
            )));
        }
        for metric in &capacity.metrics {
            if metric.reservation_per_node < 0 || metric.max_load_per_node < 0 || metric.total_capacity < 0 {
                return Err(ModelError::InvalidDescription(format!(
                    "negative capacity setting for metric {} in {}",
                    metric.name, app.name
                )));
            }
            if metric.max_load_per_node > 0 && metric.reservation_per_node > metric.max_load_per_node {
                return Err(ModelError::InvalidDescription(format!(
                    "reservation exceeds max load per node for metric {} in {}",
                    metric.name, app.name
                )));
            }
        }
        if force {
            return Ok(());
        }

        let own = self.application_ids.get(&app.name).copied();
        for metric in &capacity.metrics {
            let required = metric.reservation_per_node * i64::from(capacity.min_nodes);
            if required == 0 {
                continue;
            }
            let cluster_capacity: i64 = self
                .nodes
                .values()
                .filter(|n| n.is_up)
                .filter_map(|n| n.capacities.get(&metric.name))
                .sum();
            let reserved_by_others: i64 = self
                .applications
                .values()
                .filter(|a| Some(a.id) != own)
                .filter_map(|a| a.description.capacity.as_ref())
                .flat_map(|c| {
                    c.metrics
                        .iter()
                        .filter(|m| m.name == metric.name)
                        .map(move |m| m.reservation_per_node * i64::from(c.min_nodes))
                })
                .sum();
            let available = cluster_capacity - reserved_by_others;
            if required > available {
                return Err(ModelError::InsufficientClusterCapacity {
                    metric: metric.name.clone(),
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    fn sync_service_packages(&mut self, app: ApplicationId, packages: &[ServicePackageDescription]) {
        let mut keep = BTreeSet::new();
        for pkg in packages {
            let key = (app, pkg.name.clone());
            let id = match self.service_package_ids.get(&key) {
                Some(id) => *id,
                None => {
                    let id = ServicePackageId(self.allocate_id());
                    self.service_package_ids.insert(key, id);
                    id
                }
            };
            self.service_package_table.insert(
                id,
                ServicePackageEntry {
                    id,
                    application: app,
                    description: pkg.clone(),
                },
            );
            keep.insert(id);
        }

        let Some(entry) = self.applications.get_mut(&app) else {
            return;
        };
        let removed: Vec<ServicePackageId> =
            entry.service_packages.difference(&keep).copied().collect();
        entry.service_packages = keep;
        for id in removed {
            if let Some(pkg) = self.service_package_table.remove(&id) {
                self.service_package_ids.remove(&(app, pkg.description.name));
            }
        }
    }

    fn attach_app_group(&mut self, app: ApplicationId) {
        let Some(entry) = self.applications.get(&app) else {
            return;
        };
        let capacity = entry.description.capacity.clone().unwrap_or_default();
        let new_metrics: Vec<String> = capacity.metrics.iter().map(|m| m.name.clone()).collect();
        let reserved: BTreeMap<String, i64> = capacity
            .metrics
            .iter()
            .filter(|m| m.reservation_per_node > 0 && capacity.min_nodes > 0)
            .map(|m| (m.name.clone(), m.reservation_per_node * i64::from(capacity.min_nodes)))
            .collect();

        let mut candidates: BTreeSet<DomainId> = entry
            .services
            .iter()
            .filter_map(|s| self.service_to_domain.get(s).copied())
            .collect();
        candidates.extend(self.application_to_domain.get(&app).copied());
        candidates.extend(
            new_metrics
                .iter()
                .filter_map(|m| self.metric_to_domain.get(m).copied()),
        );
        let domain_id = self.merge_or_create(candidates);

        let old_metrics = self
            .applications
            .get_mut(&app)
            .map(|e| std::mem::replace(&mut e.registered_metrics, new_metrics.clone()))
            .unwrap_or_default();
        let newly_attached = self.application_to_domain.insert(app, domain_id).is_none();

        let Some(domain) = self.domains.get_mut(&domain_id) else {
            panic!("{domain_id} vanished while attaching {app}");
        };
        domain.applications.insert(app);
        for metric in &new_metrics {
            domain.add_metric(metric);
            self.metric_to_domain.insert(metric.clone(), domain_id);
        }
        if !newly_attached {
            for metric in &old_metrics {
                if domain.release_metric(metric) {
                    self.metric_to_domain.remove(metric);
                }
            }
        }
        domain.reservation.set_reserved(app, reserved);
    }

    fn detach_app_group(&mut self, app: ApplicationId) {
        let Some(domain_id) = self.application_to_domain.remove(&app) else {
            return;
        };
        let metrics = self
            .applications
            .get_mut(&app)
            .map(|e| std::mem::take(&mut e.registered_metrics))
            .unwrap_or_default();
        let Some(domain) = self.domains.get_mut(&domain_id) else {
            panic!("application {app} mapped to missing {domain_id}");
        };
        domain.applications.remove(&app);
        domain.reservation.remove(app);
        for metric in &metrics {
            if domain.release_metric(metric) {
                self.metric_to_domain.remove(metric);
            }
        }
        domain.generation += 1;
        self.teardown_if_empty(domain_id);
    }

    /// Delete an application that no longer has services.
    pub fn delete_application(&mut self, name: &str) -> ModelResult<bool> {
        let Some(id) = self.application_ids.get(name).copied() else {
            return Ok(false);
        };
        if self
            .applications
            .get(&id)
            .is_some_and(|a| !a.services.is_empty())
        {
            return Err(ModelError::ApplicationInUse(name.to_string()));
        }
        self.detach_app_group(id);
        self.sync_service_packages(id, &[]);
        self.applications.remove(&id);
        self.application_ids.remove(name);
        info!(application = %name, "application deleted");
        Ok(true)
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationEntry> {
        self.application_ids
            .get(name)
            .and_then(|id| self.applications.get(id))
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationEntry> {
        self.applications.values()
    }

    pub fn service_package(&self, id: ServicePackageId) -> Option<&ServicePackageEntry> {
        self.service_package_table.get(&id)
    }

    pub fn service_packages(&self) -> impl Iterator<Item = &ServicePackageEntry> {
        self.service_package_table.values()
    }

    fn domains_of_application(&self, app: ApplicationId) -> BTreeSet<DomainId> {
        let mut out: BTreeSet<DomainId> = self
            .applications
            .get(&app)
            .map(|a| {
                a.services
                    .iter()
                    .filter_map(|s| self.service_to_domain.get(s).copied())
                    .collect()
            })
            .unwrap_or_default();
        out.extend(self.application_to_domain.get(&app).copied());
        out
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or replace a service, placing it in (or merging) the domain of
    /// every metric, affinity partner and app-group application it touches.
    pub fn update_service(&mut self, service: ServiceDescription) -> ModelResult<ServiceId> {
        let (application, package) = self.validate_service(&service)?;
        let existing = self.service_ids.get(&service.name).copied();
        let metrics = self.service_metrics(&service, package);

        let mut candidates = BTreeSet::new();
        for metric in &metrics {
            candidates.extend(self.metric_to_domain.get(&metric.name).copied());
        }
        if let Some(app) = application {
            candidates.extend(self.application_to_domain.get(&app).copied());
        }
        if let Some(parent) = service
            .affinity
            .as_ref()
            .and_then(|a| self.service_ids.get(&a.parent_service))
        {
            candidates.extend(self.service_to_domain.get(parent).copied());
        }
        for child in self.services.values().filter(|s| {
            s.description
                .affinity
                .as_ref()
                .is_some_and(|a| a.parent_service == service.name)
        }) {
            candidates.extend(self.service_to_domain.get(&child.id).copied());
        }
        if let Some(id) = existing {
            candidates.extend(self.service_to_domain.get(&id).copied());
        }
        let domain_id = self.merge_or_create(candidates);

        let id = existing.unwrap_or_else(|| ServiceId(self.allocate_id()));
        let previous = self.services.remove(&id);
        let old_metrics: Vec<String> = previous
            .as_ref()
            .map(|p| p.metrics.iter().map(|m| m.name.clone()).collect())
            .unwrap_or_default();
        let old_app = previous.as_ref().and_then(|p| p.application);
        let failover_units = previous.map(|p| p.failover_units).unwrap_or_default();

        let Some(domain) = self.domains.get_mut(&domain_id) else {
            panic!("{domain_id} vanished while updating {}", service.name);
        };
        for metric in &metrics {
            domain.add_metric(&metric.name);
            self.metric_to_domain.insert(metric.name.clone(), domain_id);
        }
        for metric in &old_metrics {
            if domain.release_metric(metric) {
                self.metric_to_domain.remove(metric);
            }
        }
        domain.services.insert(id);
        domain.generation += 1;
        self.service_to_domain.insert(id, domain_id);

        if old_app != application {
            if let Some(old) = old_app.and_then(|a| self.applications.get_mut(&a)) {
                old.services.remove(&id);
            }
        }
        if let Some(app) = application.and_then(|a| self.applications.get_mut(&a)) {
            app.services.insert(id);
        }
        self.service_ids.insert(service.name.clone(), id);
        debug!(
            service = %service.name,
            %domain_id,
            metrics = metrics.len(),
            "service updated"
        );
        self.services.insert(
            id,
            ServiceEntry {
                id,
                description: service,
                application,
                service_package: package,
                metrics,
                failover_units,
            },
        );

        for app in old_app.into_iter().chain(application) {
            self.refresh_app_reservation_use(app);
        }
        Ok(id)
    }

    fn validate_service(
        &self,
        service: &ServiceDescription,
    ) -> ModelResult<(Option<ApplicationId>, Option<ServicePackageId>)> {
        if !self.service_types.contains_key(&service.service_type) {
            return Err(ModelError::UnknownServiceType(service.service_type.clone()));
        }
        if service.is_stateful && service.target_replica_set_size < 1 {
            return Err(ModelError::InvalidDescription(format!(
                "stateful service {} needs a positive target replica set size",
                service.name
            )));
        }
        if service.target_replica_set_size < -1 {
            return Err(ModelError::InvalidDescription(format!(
                "invalid instance count {} for {}",
                service.target_replica_set_size, service.name
            )));
        }
        if service.partition_count == 0 {
            return Err(ModelError::InvalidDescription(format!(
                "service {} has no partitions",
                service.name
            )));
        }
        let mut names = BTreeSet::new();
        for metric in &service.metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(ModelError::InvalidDescription(format!(
                    "duplicate metric {} in {}",
                    metric.name, service.name
                )));
            }
            if metric.weight < 0.0 || metric.primary_default_load < 0 || metric.secondary_default_load < 0 {
                return Err(ModelError::InvalidDescription(format!(
                    "negative weight or default load for metric {} in {}",
                    metric.name, service.name
                )));
            }
        }
        if let Some(existing) = self.service_ids.get(&service.name).and_then(|id| self.services.get(id))
            && existing.description.is_stateful != service.is_stateful
        {
            return Err(ModelError::InvalidDescription(format!(
                "service {} cannot change statefulness",
                service.name
            )));
        }

        if let Some(affinity) = &service.affinity {
            if affinity.parent_service == service.name {
                return Err(ModelError::AffinityChainNotSupported(service.name.clone()));
            }
            let parent = self
                .service_ids
                .get(&affinity.parent_service)
                .and_then(|id| self.services.get(id));
            if parent.is_some_and(|p| p.description.affinity.is_some()) {
                return Err(ModelError::AffinityChainNotSupported(
                    affinity.parent_service.clone(),
                ));
            }
            let has_children = self.services.values().any(|s| {
                s.description
                    .affinity
                    .as_ref()
                    .is_some_and(|a| a.parent_service == service.name)
            });
            if has_children {
                return Err(ModelError::AffinityChainNotSupported(service.name.clone()));
            }
        }

        let application = match &service.application {
            Some(name) => Some(
                self.application_ids
                    .get(name)
                    .copied()
                    .ok_or_else(|| ModelError::ApplicationNotFound(name.clone()))?,
            ),
            None => None,
        };
        let package = match (&service.service_package, application, &service.application) {
            (Some(pkg), Some(app), Some(app_name)) => Some(
                self.service_package_ids
                    .get(&(app, pkg.clone()))
                    .copied()
                    .ok_or_else(|| ModelError::ServicePackageNotFound {
                        application: app_name.clone(),
                        package: pkg.clone(),
                    })?,
            ),
            (Some(pkg), _, _) => {
                return Err(ModelError::InvalidDescription(format!(
                    "service {} names package {pkg} without an application",
                    service.name
                )));
            }
            (None, _, _) => None,
        };
        Ok((application, package))
    }

    /// Effective metrics of a service: declared (or implicit count) metrics,
    /// plus the governance metrics when its package is governed.
    fn service_metrics(
        &self,
        service: &ServiceDescription,
        package: Option<ServicePackageId>,
    ) -> Vec<ServiceMetric> {
        let mut metrics = service.effective_metrics();
        let governed = package
            .and_then(|p| self.service_package_table.get(&p))
            .and_then(|p| p.description.governance.as_ref())
            .is_some_and(|g| g.is_governed());
        if governed {
            for name in [CPU_CORES_METRIC, MEMORY_IN_MB_METRIC] {
                if !metrics.iter().any(|m| m.name == name) {
                    metrics.push(ServiceMetric::new(name, 1.0, 0, 0));
                }
            }
        }
        metrics
    }

    /// Delete a service and all of its failover units.
    pub fn delete_service(&mut self, name: &str) -> bool {
        let Some(id) = self.service_ids.remove(name) else {
            return false;
        };
        let Some(entry) = self.services.remove(&id) else {
            panic!("service index points at missing {id} ({name})");
        };
        for fu in &entry.failover_units {
            self.remove_failover_unit_entry(fu);
        }
        let Some(domain_id) = self.service_to_domain.remove(&id) else {
            panic!("service {name} has no domain");
        };
        if let Some(domain) = self.domains.get_mut(&domain_id) {
            domain.services.remove(&id);
            for metric in &entry.metrics {
                if domain.release_metric(&metric.name) {
                    self.metric_to_domain.remove(&metric.name);
                }
            }
            domain.generation += 1;
        }
        if let Some(app) = entry.application {
            if let Some(app_entry) = self.applications.get_mut(&app) {
                app_entry.services.remove(&id);
            }
            self.refresh_app_reservation_use(app);
        }
        self.teardown_if_empty(domain_id);
        info!(service = %name, "service deleted");
        true
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.service_ids.get(name).and_then(|id| self.services.get(id))
    }

    pub fn service_by_id(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.services.get(&id)
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    // ── Failover units ─────────────────────────────────────────────

    pub fn update_failover_unit(
        &mut self,
        fu: FailoverUnitDescription,
    ) -> ModelResult<FailoverUnitUpdate> {
        let service_id = self
            .service_ids
            .get(&fu.service_name)
            .copied()
            .ok_or_else(|| ModelError::ServiceNotFound(fu.service_name.clone()))?;
        let mut seen = BTreeSet::new();
        for replica in &fu.replicas {
            if !seen.insert(replica.node_id.as_str()) {
                return Err(ModelError::InvalidDescription(format!(
                    "failover unit {} has two replicas on {}",
                    fu.id, replica.node_id
                )));
            }
        }

        let outcome = match self.failover_units.get(&fu.id) {
            Some(existing) if existing.service != service_id => {
                return Err(ModelError::InvalidDescription(format!(
                    "failover unit {} belongs to another service",
                    fu.id
                )));
            }
            Some(existing) if fu.version == existing.description.version && fu == existing.description => {
                return Ok(FailoverUnitUpdate::Unchanged);
            }
            Some(existing) if fu.version <= existing.description.version => {
                return Err(ModelError::StaleVersion {
                    id: fu.id,
                    stored: existing.description.version,
                    received: fu.version,
                });
            }
            Some(existing) => FailoverUnitUpdate::Updated {
                previous_version: existing.description.version,
            },
            None => FailoverUnitUpdate::Inserted,
        };

        let loads = self
            .remove_failover_unit_entry(&fu.id)
            .map(|old| old.loads)
            .unwrap_or_default();
        let id = fu.id;
        let entry = FailoverUnitEntry {
            description: fu,
            service: service_id,
            loads,
        };
        self.insert_failover_unit_entry(entry);
        debug!(failover_unit = %id, ?outcome, "failover unit updated");
        Ok(outcome)
    }

    pub fn delete_failover_unit(&mut self, service_name: &str, id: &FailoverUnitId) -> bool {
        let matches = self.failover_units.get(id).is_some_and(|fu| {
            self.services
                .get(&fu.service)
                .is_some_and(|s| s.description.name == service_name)
        });
        if !matches {
            return false;
        }
        self.remove_failover_unit_entry(id);
        debug!(failover_unit = %id, service = %service_name, "failover unit deleted");
        true
    }

    fn insert_failover_unit_entry(&mut self, entry: FailoverUnitEntry) {
        let id = entry.description.id;
        let service_id = entry.service;
        let domain_id = self.domain_of_service_id(service_id);
        let healthy = entry.healthy_nodes();
        let in_build = entry.in_build_nodes();
        if let Some(domain) = self.domains.get_mut(&domain_id) {
            domain.failover_units.insert(id);
            domain.add_counts(&healthy, &in_build);
            domain.generation += 1;
        }
        let app = self.services.get_mut(&service_id).and_then(|s| {
            s.failover_units.insert(id);
            s.application
        });
        self.failover_units.insert(id, entry);
        if let Some(app) = app {
            self.refresh_app_reservation_use(app);
        }
    }

    fn remove_failover_unit_entry(&mut self, id: &FailoverUnitId) -> Option<FailoverUnitEntry> {
        let entry = self.failover_units.remove(id)?;
        let domain_id = self.domain_of_service_id(entry.service);
        if let Some(domain) = self.domains.get_mut(&domain_id) {
            domain.failover_units.remove(id);
            domain.remove_counts(&entry.healthy_nodes(), &entry.in_build_nodes());
            domain.generation += 1;
        }
        let app = self.services.get_mut(&entry.service).and_then(|s| {
            s.failover_units.remove(id);
            s.application
        });
        if let Some(app) = app {
            self.refresh_app_reservation_use(app);
        }
        Some(entry)
    }

    pub fn failover_unit(&self, id: &FailoverUnitId) -> Option<&FailoverUnitEntry> {
        self.failover_units.get(id)
    }

    pub fn failover_units(&self) -> impl Iterator<Item = &FailoverUnitEntry> {
        self.failover_units.values()
    }

    pub fn failover_unit_count(&self) -> usize {
        self.failover_units.len()
    }

    // ── Loads ──────────────────────────────────────────────────────

    /// Merge a load report into the stored loads. Returns false when the
    /// failover unit is unknown. Always advances the domain load stamp but
    /// only bumps the generation when `interrupt` is set, so frequent
    /// reports do not abandon passes in flight.
    pub fn update_load_or_move_cost(&mut self, report: &LoadOrMoveCostDescription, interrupt: bool) -> bool {
        let Some(entry) = self.failover_units.get_mut(&report.failover_unit_id) else {
            debug!(failover_unit = %report.failover_unit_id, "load report for unknown failover unit");
            return false;
        };
        let service_matches = self
            .services
            .get(&entry.service)
            .is_some_and(|s| s.description.name == report.service_name);
        if !service_matches {
            warn!(
                failover_unit = %report.failover_unit_id,
                service = %report.service_name,
                "load report names the wrong service"
            );
            return false;
        }

        let clamp = |metric: &str, value: i64| {
            if value < 0 {
                warn!(%metric, value, "negative load reported, clamping to zero");
            }
            value.max(0)
        };
        for (metric, value) in &report.primary_loads {
            entry.loads.primary.insert(metric.clone(), clamp(metric, *value));
        }
        for (metric, value) in &report.secondary_loads {
            entry.loads.secondary.insert(metric.clone(), clamp(metric, *value));
        }
        for (node, loads) in &report.secondary_loads_per_node {
            let per_node = entry.loads.secondary_per_node.entry(node.clone()).or_default();
            for (metric, value) in loads {
                per_node.insert(metric.clone(), clamp(metric, *value));
            }
        }
        if report.primary_move_cost.is_some() {
            entry.loads.primary_move_cost = report.primary_move_cost;
        }
        if report.secondary_move_cost.is_some() {
            entry.loads.secondary_move_cost = report.secondary_move_cost;
        }

        let service = entry.service;
        let app = self.services.get(&service).and_then(|s| s.application);
        if let Some(app) = app {
            self.refresh_app_reservation_use(app);
        }
        let domain = self.domain_of_service_id(service);
        if let Some(entry) = self.domains.get_mut(&domain) {
            entry.load_stamp += 1;
        }
        if interrupt {
            self.bump_generation(domain);
        }
        true
    }

    /// Reset the loads of a partition back to the service defaults.
    pub fn reset_partition_load(
        &mut self,
        id: &FailoverUnitId,
        service_name: &str,
        is_stateful: bool,
    ) -> ModelResult<()> {
        let entry = self
            .failover_units
            .get_mut(id)
            .ok_or(ModelError::FailoverUnitNotFound(*id))?;
        let Some(service) = self.services.get(&entry.service) else {
            panic!("failover unit {id} points at a missing service");
        };
        if service.description.name != service_name || service.description.is_stateful != is_stateful {
            return Err(ModelError::InvalidDescription(format!(
                "failover unit {id} does not belong to {} service {service_name}",
                if is_stateful { "stateful" } else { "stateless" }
            )));
        }
        entry.loads.primary.clear();
        entry.loads.secondary.clear();
        entry.loads.secondary_per_node.clear();

        let service_id = entry.service;
        if let Some(app) = service.application {
            self.refresh_app_reservation_use(app);
        }
        let domain = self.domain_of_service_id(service_id);
        self.bump_generation(domain);
        debug!(failover_unit = %id, "partition load reset");
        Ok(())
    }

    /// Recompute how much of an app-group application's reservation is
    /// covered by the load it already has on each node.
    fn refresh_app_reservation_use(&mut self, app: ApplicationId) {
        let Some(domain_id) = self.application_to_domain.get(&app).copied() else {
            return;
        };
        let Some(entry) = self.applications.get(&app) else {
            return;
        };
        let reservations: Vec<(String, i64)> = entry
            .description
            .capacity
            .iter()
            .flat_map(|c| c.metrics.iter())
            .filter(|m| m.reservation_per_node > 0)
            .map(|m| (m.name.clone(), m.reservation_per_node))
            .collect();

        let mut used = BTreeMap::new();
        if !reservations.is_empty() {
            let node_loads = self.application_node_loads(app);
            for (metric, reservation) in &reservations {
                let covered: i64 = node_loads
                    .values()
                    .map(|loads| loads.get(metric).copied().unwrap_or(0).min(*reservation))
                    .sum();
                if covered > 0 {
                    used.insert(metric.clone(), covered);
                }
            }
        }
        if let Some(domain) = self.domains.get_mut(&domain_id) {
            domain.reservation.set_used(app, used);
        }
    }

    /// Load of an application per node and metric, over healthy replicas.
    /// Nodes hosting a replica appear even when the load is zero.
    pub fn application_node_loads(&self, app: ApplicationId) -> BTreeMap<NodeId, BTreeMap<String, i64>> {
        let mut out: BTreeMap<NodeId, BTreeMap<String, i64>> = BTreeMap::new();
        let Some(entry) = self.applications.get(&app) else {
            return out;
        };
        for service in entry.services.iter().filter_map(|s| self.services.get(s)) {
            for fu in service
                .failover_units
                .iter()
                .filter_map(|id| self.failover_units.get(id))
            {
                for replica in fu.description.replicas.iter().filter(|r| r.is_healthy()) {
                    let node = out.entry(replica.node_id.clone()).or_default();
                    for metric in &service.metrics {
                        let load = fu.loads.load(
                            &service.metrics,
                            service.description.is_stateful,
                            &metric.name,
                            replica.role,
                            &replica.node_id,
                        );
                        *node.entry(metric.name.clone()).or_insert(0) += load;
                    }
                }
            }
        }
        out
    }

    // ── Cluster upgrade ────────────────────────────────────────────

    pub fn update_cluster_upgrade(&mut self, in_progress: bool, completed: BTreeSet<String>) -> bool {
        if self.cluster_upgrade_in_progress == in_progress && self.completed_upgrade_domains == completed {
            return false;
        }
        info!(in_progress, completed = completed.len(), "cluster upgrade state changed");
        self.cluster_upgrade_in_progress = in_progress;
        self.completed_upgrade_domains = completed;
        self.bump_all_generations();
        true
    }

    pub fn cluster_upgrade_in_progress(&self) -> bool {
        self.cluster_upgrade_in_progress
    }

    // ── Domains ────────────────────────────────────────────────────

    /// Merge all candidate domains into one, or create a domain when there
    /// are none. The domain with the most entities survives; ties go to the
    /// lowest id.
    fn merge_or_create(&mut self, candidates: BTreeSet<DomainId>) -> DomainId {
        let survivor = candidates.iter().copied().max_by(|a, b| {
            let size = |id: &DomainId| self.domains.get(id).map_or(0, |d| d.entity_count());
            size(a).cmp(&size(b)).then(b.cmp(a))
        });
        let Some(survivor) = survivor else {
            let id = DomainId(self.allocate_id());
            self.domains.insert(id, ServiceDomain::new(id));
            debug!(domain = %id, "service domain created");
            return id;
        };

        for other in candidates.into_iter().filter(|id| *id != survivor) {
            let Some(absorbed) = self.domains.remove(&other) else {
                continue;
            };
            for service in &absorbed.services {
                self.service_to_domain.insert(*service, survivor);
            }
            for app in &absorbed.applications {
                self.application_to_domain.insert(*app, survivor);
            }
            for metric in absorbed.metrics.keys() {
                self.metric_to_domain.insert(metric.clone(), survivor);
            }
            info!(%survivor, absorbed = %other, "service domains merged");
            if let Some(domain) = self.domains.get_mut(&survivor) {
                domain.absorb(absorbed);
            }
        }
        survivor
    }

    fn teardown_if_empty(&mut self, id: DomainId) {
        let empty = self.domains.get(&id).is_some_and(|d| d.entity_count() == 0);
        if !empty {
            return;
        }
        if let Some(domain) = self.domains.remove(&id) {
            assert!(
                domain.failover_units.is_empty(),
                "{id} torn down with {} failover units",
                domain.failover_units.len()
            );
            for metric in domain.metrics.keys() {
                if self.metric_to_domain.get(metric) == Some(&id) {
                    self.metric_to_domain.remove(metric);
                }
            }
            debug!(domain = %id, "service domain torn down");
        }
    }

    fn domain_of_service_id(&self, id: ServiceId) -> DomainId {
        match self.service_to_domain.get(&id) {
            Some(domain) => *domain,
            None => panic!("service {id} has no domain"),
        }
    }

    fn bump_generation(&mut self, id: DomainId) {
        if let Some(domain) = self.domains.get_mut(&id) {
            domain.generation += 1;
        }
    }

    fn bump_all_generations(&mut self) {
        for domain in self.domains.values_mut() {
            domain.generation += 1;
        }
    }

    pub fn domain_ids(&self) -> Vec<DomainId> {
        self.domains.keys().copied().collect()
    }

    pub fn domain(&self, id: DomainId) -> Option<&ServiceDomain> {
        self.domains.get(&id)
    }

    pub fn domains(&self) -> impl Iterator<Item = &ServiceDomain> {
        self.domains.values()
    }

    pub fn domain_of_service(&self, name: &str) -> Option<DomainId> {
        self.service_ids
            .get(name)
            .and_then(|id| self.service_to_domain.get(id))
            .copied()
    }

    pub fn domain_of_metric(&self, metric: &str) -> Option<DomainId> {
        self.metric_to_domain.get(metric).copied()
    }

    pub fn domain_of_application(&self, name: &str) -> Option<DomainId> {
        self.application_ids
            .get(name)
            .and_then(|id| self.application_to_domain.get(id))
            .copied()
    }

    pub fn domain_of_failover_unit(&self, id: &FailoverUnitId) -> Option<DomainId> {
        self.failover_units
            .get(id)
            .and_then(|fu| self.service_to_domain.get(&fu.service))
            .copied()
    }

    pub fn generation(&self, id: DomainId) -> Option<u64> {
        self.domains.get(&id).map(|d| d.generation)
    }

    pub fn load_stamp(&self, id: DomainId) -> Option<u64> {
        self.domains.get(&id).map(|d| d.load_stamp)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Copy everything one domain needs for a scheduling pass.
    pub fn snapshot(&self, id: DomainId) -> Option<DomainSnapshot> {
        let domain = self.domains.get(&id)?;
        let metrics: Vec<String> = domain.metrics.keys().cloned().collect();

        let nodes = self
            .nodes
            .values()
            .map(|n| NodeView {
                id: n.node_id.clone(),
                fault_domain: n.fault_domain.clone(),
                upgrade_domain: n.upgrade_domain.clone(),
                properties: n.properties.clone(),
                capacities: n
                    .capacities
                    .iter()
                    .filter(|(m, _)| domain.metrics.contains_key(*m))
                    .map(|(m, v)| (m.clone(), *v))
                    .collect(),
                is_up: n.is_up,
                deactivation: n.deactivation,
                images: self.node_images.get(&n.node_id).cloned().unwrap_or_default(),
            })
            .collect();

        let mut services = BTreeMap::new();
        let mut applications = BTreeMap::new();
        let mut service_packages = BTreeMap::new();
        for service in domain.services.iter().filter_map(|s| self.services.get(s)) {
            let desc = &service.description;
            let service_type = self.service_types.get(&desc.service_type);
            services.insert(
                service.id,
                ServiceView {
                    id: service.id,
                    name: desc.name.clone(),
                    service_type: desc.service_type.clone(),
                    service_type_known: service_type.is_some(),
                    blocked_nodes: service_type.map(|t| t.blocked_nodes.clone()).unwrap_or_default(),
                    is_stateful: desc.is_stateful,
                    on_every_node: desc.is_on_every_node(),
                    placement_constraints: desc.placement_constraints.clone(),
                    affinity_parent: desc
                        .affinity
                        .as_ref()
                        .and_then(|a| self.service_ids.get(&a.parent_service).copied()),
                    affinity_aligned: desc.affinity.as_ref().is_some_and(|a| a.aligned),
                    metrics: service.metrics.clone(),
                    default_move_cost: desc.default_move_cost,
                    target_replica_set_size: desc.target_replica_set_size,
                    application: service.application,
                    service_package: service.service_package,
                },
            );
            if let Some(app) = service.application {
                self.add_application_view(app, &mut applications);
            }
            if let Some(pkg) = service.service_package.and_then(|p| self.service_package_table.get(&p)) {
                service_packages.insert(
                    pkg.id,
                    ServicePackageView {
                        id: pkg.id,
                        application: pkg.application,
                        name: pkg.description.name.clone(),
                        governance: pkg.description.governance.clone(),
                        container_images: pkg.description.container_images.clone(),
                    },
                );
            }
        }
        for app in &domain.applications {
            self.add_application_view(*app, &mut applications);
        }

        let failover_units = domain
            .failover_units
            .iter()
            .filter_map(|id| self.failover_units.get(id))
            .map(|fu| FailoverUnitView {
                id: fu.description.id,
                service: fu.service,
                version: fu.description.version,
                is_in_transition: fu.description.is_in_transition,
                target_replica_count: fu.description.target_replica_count,
                replicas: fu.description.replicas.clone(),
                loads: fu.loads.clone(),
            })
            .collect();

        let unused_reservation = domain
            .reservation
            .metrics()
            .map(|m| {
                let unused = domain.reservation.total_reserved(m) - domain.reservation.reserved_load_used(m);
                (m.clone(), unused.max(0))
            })
            .collect();

        Some(DomainSnapshot {
            domain_id: id,
            generation: domain.generation,
            load_stamp: domain.load_stamp,
            nodes,
            metrics,
            services,
            failover_units,
            applications,
            service_packages,
            cluster_upgrade_in_progress: self.cluster_upgrade_in_progress,
            completed_upgrade_domains: self.completed_upgrade_domains.clone(),
            unused_reservation,
        })
    }

    fn add_application_view(&self, id: ApplicationId, out: &mut BTreeMap<ApplicationId, ApplicationView>) {
        if out.contains_key(&id) {
            return;
        }
        if let Some(app) = self.applications.get(&id) {
            out.insert(
                id,
                ApplicationView {
                    id,
                    name: app.description.name.clone(),
                    capacity: app.description.capacity.clone(),
                    upgrade_in_progress: app.description.upgrade_in_progress,
                    completed_upgrade_domains: app.description.completed_upgrade_domains.clone(),
                },
            );
        }
    }

    // ── Consistency ────────────────────────────────────────────────

    /// Check every index against the tables it mirrors. Panics on the first
    /// inconsistency: a mismatch here is a bug, never a runtime condition.
    pub fn verify_consistency(&self) {
        for (name, id) in &self.service_ids {
            let service = self
                .services
                .get(id)
                .unwrap_or_else(|| panic!("service index {name} points at missing {id}"));
            let domain_id = self
                .service_to_domain
                .get(id)
                .unwrap_or_else(|| panic!("service {name} has no domain"));
            let domain = self
                .domains
                .get(domain_id)
                .unwrap_or_else(|| panic!("service {name} mapped to missing {domain_id}"));
            assert!(domain.services.contains(id), "{domain_id} does not list {name}");
            for metric in &service.metrics {
                assert_eq!(
                    self.metric_to_domain.get(&metric.name),
                    Some(domain_id),
                    "metric {} of {name} is not indexed to {domain_id}",
                    metric.name
                );
            }
            for fu in &service.failover_units {
                assert!(domain.failover_units.contains(fu), "{domain_id} does not list failover unit {fu}");
            }
        }
        for (app, domain_id) in &self.application_to_domain {
            let domain = self
                .domains
                .get(domain_id)
                .unwrap_or_else(|| panic!("application {app} mapped to missing {domain_id}"));
            assert!(domain.applications.contains(app), "{domain_id} does not list {app}");
        }
        for (metric, domain_id) in &self.metric_to_domain {
            let domain = self
                .domains
                .get(domain_id)
                .unwrap_or_else(|| panic!("metric {metric} mapped to missing {domain_id}"));
            assert!(domain.metrics.contains_key(metric), "{domain_id} does not own metric {metric}");
        }
        let mut total_units = 0;
        for domain in self.domains.values() {
            assert!(domain.entity_count() > 0, "{} is empty but alive", domain.id);
            for metric in domain.metrics.keys() {
                assert_eq!(self.metric_to_domain.get(metric), Some(&domain.id));
            }
            for service in &domain.services {
                assert_eq!(self.service_to_domain.get(service), Some(&domain.id));
            }
            let mut healthy = BTreeMap::new();
            let mut in_build = BTreeMap::new();
            for fu in &domain.failover_units {
                let entry = self
                    .failover_units
                    .get(fu)
                    .unwrap_or_else(|| panic!("{} lists missing failover unit {fu}", domain.id));
                assert_eq!(self.service_to_domain.get(&entry.service), Some(&domain.id));
                for node in entry.healthy_nodes() {
                    *healthy.entry(node).or_insert(0u32) += 1;
                }
                for node in entry.in_build_nodes() {
                    *in_build.entry(node).or_insert(0u32) += 1;
                }
            }
            total_units += domain.failover_units.len();
            assert_eq!(healthy, domain.node_replica_counts, "{} replica counters drifted", domain.id);
            assert_eq!(in_build, domain.node_in_build_counts, "{} in-build counters drifted", domain.id);
        }
        assert_eq!(total_units, self.failover_units.len(), "failover unit orphaned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(id: &str, capacities: &[(&str, i64)]) -> NodeDescription {
        NodeDescription {
            node_id: id.into(),
            fault_domain: format!("fd:/{id}"),
            upgrade_domain: format!("ud{id}"),
            properties: BTreeMap::new(),
            capacities: capacities.iter().map(|(m, v)| (m.to_string(), *v)).collect(),
            is_up: true,
            deactivation: None,
        }
    }

    fn service(name: &str, metrics: &[&str]) -> ServiceDescription {
        ServiceDescription {
            name: name.into(),
            service_type: "T".into(),
            application: None,
            service_package: None,
            is_stateful: true,
            placement_constraints: String::new(),
            affinity: None,
            metrics: metrics.iter().map(|m| ServiceMetric::new(m, 1.0, 3, 1)).collect(),
            default_move_cost: MoveCost::Low,
            partition_count: 1,
            target_replica_set_size: 1,
            auto_scaling_policies: vec![],
        }
    }

    fn app(name: &str, min_nodes: u32, cpu_reservation: i64) -> ApplicationDescription {
        ApplicationDescription {
            name: name.into(),
            capacity: Some(ApplicationCapacity {
                min_nodes,
                max_nodes: 0,
                metrics: vec![ApplicationMetric {
                    name: "CPU".into(),
                    reservation_per_node: cpu_reservation,
                    max_load_per_node: 0,
                    total_capacity: 0,
                }],
            }),
            service_packages: vec![],
            upgrade_in_progress: false,
            completed_upgrade_domains: BTreeSet::new(),
        }
    }

    fn failover_unit(id: Uuid, service: &str, version: u64, nodes: &[&str]) -> FailoverUnitDescription {
        FailoverUnitDescription {
            id,
            service_name: service.into(),
            version,
            is_in_transition: false,
            target_replica_count: None,
            replicas: nodes
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    let role = if i == 0 { ReplicaRole::Primary } else { ReplicaRole::Secondary };
                    ReplicaDescription::new(n, role)
                })
                .collect(),
        }
    }

    fn model_with_type() -> ClusterModel {
        let mut model = ClusterModel::new();
        model.update_service_type(ServiceTypeDescription {
            name: "T".into(),
            blocked_nodes: BTreeSet::new(),
        });
        model
    }

    #[test]
    fn shared_metric_merges_domains() {
        let mut model = model_with_type();
        model.update_service(service("A", &["CPU"])).unwrap();
        model.update_service(service("B", &["Mem"])).unwrap();
        assert_ne!(model.domain_of_service("A"), model.domain_of_service("B"));

        let before = model.domain_of_service("A").unwrap();
        model.update_service(service("C", &["CPU", "Mem"])).unwrap();
        let merged = model.domain_of_service("C").unwrap();
        assert_eq!(merged, before, "lowest id survives a tie");
        assert_eq!(model.domain_of_service("A"), Some(merged));
        assert_eq!(model.domain_of_service("B"), Some(merged));
        assert_eq!(model.domain_of_metric("Mem"), Some(merged));
        assert_eq!(model.domain_ids().len(), 1);
        model.verify_consistency();
    }

    #[test]
    fn deleting_last_service_tears_down_domain() {
        let mut model = model_with_type();
        model.update_service(service("A", &["CPU"])).unwrap();
        let id = Uuid::new_v4();
        model.update_failover_unit(failover_unit(id, "A", 1, &["N1"])).unwrap();

        assert!(model.delete_service("A"));
        assert!(model.domain_ids().is_empty());
        assert!(model.domain_of_metric("CPU").is_none());
        assert!(model.failover_unit(&id).is_none());
        assert!(!model.delete_service("A"));
        model.verify_consistency();
    }

    #[test]
    fn domains_never_split_on_metric_removal() {
        let mut model = model_with_type();
        model.update_service(service("A", &["CPU"])).unwrap();
        model.update_service(service("B", &["CPU", "Mem"])).unwrap();
        let domain = model.domain_of_service("A").unwrap();

        model.update_service(service("B", &["Mem"])).unwrap();
        assert_eq!(model.domain_of_service("B"), Some(domain));
        assert_eq!(model.domain_of_metric("CPU"), Some(domain));
        model.verify_consistency();
    }

    #[test]
    fn unknown_service_type_is_rejected() {
        let mut model = ClusterModel::new();
        let err = model.update_service(service("A", &["CPU"])).unwrap_err();
        assert_eq!(err, ModelError::UnknownServiceType("T".into()));
        assert_eq!(model.service_count(), 0);
    }

    #[test]
    fn affinity_chains_are_rejected() {
        let mut model = model_with_type();
        model.update_service(service("Parent", &["CPU"])).unwrap();
        let mut child = service("Child", &["Mem"]);
        child.affinity = Some(ServiceAffinity {
            parent_service: "Parent".into(),
            aligned: false,
        });
        model.update_service(child).unwrap();
        assert_eq!(model.domain_of_service("Child"), model.domain_of_service("Parent"));

        let mut grandchild = service("Grandchild", &[]);
        grandchild.affinity = Some(ServiceAffinity {
            parent_service: "Child".into(),
            aligned: false,
        });
        assert!(matches!(
            model.update_service(grandchild),
            Err(ModelError::AffinityChainNotSupported(_))
        ));
    }

    #[test]
    fn failover_unit_versions_only_move_forward() {
        let mut model = model_with_type();
        model.update_service(service("A", &["CPU"])).unwrap();
        let id = Uuid::new_v4();

        assert_eq!(
            model.update_failover_unit(failover_unit(id, "A", 5, &["N1"])).unwrap(),
            FailoverUnitUpdate::Inserted
        );
        assert_eq!(
            model.update_failover_unit(failover_unit(id, "A", 5, &["N1"])).unwrap(),
            FailoverUnitUpdate::Unchanged
        );
        assert!(matches!(
            model.update_failover_unit(failover_unit(id, "A", 4, &["N2"])),
            Err(ModelError::StaleVersion { stored: 5, received: 4, .. })
        ));
        assert!(matches!(
            model.update_failover_unit(failover_unit(id, "A", 5, &["N2"])),
            Err(ModelError::StaleVersion { .. })
        ));
        assert_eq!(
            model.update_failover_unit(failover_unit(id, "A", 6, &["N2"])).unwrap(),
            FailoverUnitUpdate::Updated { previous_version: 5 }
        );
        assert_eq!(model.failover_unit(&id).unwrap().description.replicas[0].node_id, "N2");
        model.verify_consistency();
    }

    #[test]
    fn failover_unit_for_unknown_service_is_rejected() {
        let mut model = model_with_type();
        let err = model
            .update_failover_unit(failover_unit(Uuid::new_v4(), "Missing", 1, &["N1"]))
            .unwrap_err();
        assert_eq!(err, ModelError::ServiceNotFound("Missing".into()));
    }

    #[test]
    fn negative_capacity_is_rejected() {
        let mut model = ClusterModel::new();
        assert!(matches!(
            model.update_node(node("N1", &[("CPU", -1)])),
            Err(ModelError::NegativeCapacity { .. })
        ));
        assert_eq!(model.update_node(node("N1", &[("CPU", 4)])).unwrap(), NodeChange::Added);
        assert_eq!(model.update_node(node("N1", &[("CPU", 4)])).unwrap(), NodeChange::Unchanged);
        let mut down = node("N1", &[("CPU", 4)]);
        down.is_up = false;
        assert_eq!(model.update_node(down).unwrap(), NodeChange::WentDown);
    }

    #[test]
    fn app_group_reservation_is_tracked() {
        let mut model = model_with_type();
        model.update_node(node("N1", &[("CPU", 10)])).unwrap();
        model.update_node(node("N2", &[("CPU", 10)])).unwrap();
        model.update_application(app("fabric:/a", 2, 4), false).unwrap();

        let domain_id = model.domain_of_application("fabric:/a").unwrap();
        assert_eq!(model.domain(domain_id).unwrap().reservation.total_reserved("CPU"), 8);

        let mut svc = service("fabric:/a/s", &["CPU"]);
        svc.application = Some("fabric:/a".into());
        model.update_service(svc).unwrap();
        assert_eq!(model.domain_of_service("fabric:/a/s"), Some(domain_id));

        model
            .update_failover_unit(failover_unit(Uuid::new_v4(), "fabric:/a/s", 1, &["N1"]))
            .unwrap();
        let domain = model.domain(domain_id).unwrap();
        assert_eq!(domain.reservation.reserved_load_used("CPU"), 3);

        let snapshot = model.snapshot(domain_id).unwrap();
        assert_eq!(snapshot.unused_reservation["CPU"], 5);

        assert_eq!(
            model.delete_application("fabric:/a"),
            Err(ModelError::ApplicationInUse("fabric:/a".into()))
        );
        model.delete_service("fabric:/a/s");
        assert_eq!(model.delete_application("fabric:/a"), Ok(true));
        assert!(model.domain_ids().is_empty());
        model.verify_consistency();
    }

    #[test]
    fn reservation_beyond_cluster_capacity_needs_force() {
        let mut model = model_with_type();
        model.update_node(node("N1", &[("CPU", 10)])).unwrap();
        model.update_node(node("N2", &[("CPU", 10)])).unwrap();
        model.update_application(app("fabric:/a", 2, 4), false).unwrap();

        let err = model.update_application(app("fabric:/b", 2, 8), false).unwrap_err();
        assert_eq!(
            err,
            ModelError::InsufficientClusterCapacity {
                metric: "CPU".into(),
                required: 16,
                available: 12,
            }
        );
        assert!(model.application("fabric:/b").is_none());
        assert!(model.update_application(app("fabric:/b", 2, 8), true).is_ok());
    }

    #[test]
    fn load_reports_clamp_and_only_interrupt_on_request() {
        let mut model = model_with_type();
        model.update_service(service("A", &["CPU"])).unwrap();
        let id = Uuid::new_v4();
        model.update_failover_unit(failover_unit(id, "A", 1, &["N1"])).unwrap();
        let domain = model.domain_of_service("A").unwrap();
        let generation = model.generation(domain).unwrap();
        let stamp = model.load_stamp(domain).unwrap();

        let report = LoadOrMoveCostDescription {
            failover_unit_id: id,
            service_name: "A".into(),
            is_stateful: true,
            primary_loads: BTreeMap::from([("CPU".to_string(), -7)]),
            secondary_loads: BTreeMap::new(),
            secondary_loads_per_node: BTreeMap::new(),
            primary_move_cost: Some(MoveCost::High),
            secondary_move_cost: None,
        };
        assert!(model.update_load_or_move_cost(&report, false));
        assert_eq!(model.generation(domain), Some(generation));
        assert_eq!(model.load_stamp(domain), Some(stamp + 1));
        let loads = &model.failover_unit(&id).unwrap().loads;
        assert_eq!(loads.primary["CPU"], 0);
        assert_eq!(loads.primary_move_cost, Some(MoveCost::High));

        assert!(model.update_load_or_move_cost(&report, true));
        assert_eq!(model.generation(domain), Some(generation + 1));

        model.reset_partition_load(&id, "A", true).unwrap();
        assert!(model.failover_unit(&id).unwrap().loads.primary.is_empty());
        assert!(model.reset_partition_load(&id, "A", false).is_err());
    }

    #[test]
    fn governed_package_adds_resource_metrics() {
        let mut model = model_with_type();
        let mut application = app("fabric:/rg", 0, 0);
        application.capacity = None;
        application.service_packages = vec![ServicePackageDescription {
            name: "Pkg".into(),
            governance: Some(ResourceGovernancePolicy {
                cpu_cores: 1.5,
                memory_in_mb: 512,
                code_packages: vec![],
            }),
            container_images: vec![],
        }];
        model.update_application(application.clone(), false).unwrap();

        let mut svc = service("fabric:/rg/s", &["CPU"]);
        svc.application = Some("fabric:/rg".into());
        svc.service_package = Some("Pkg".into());
        model.update_service(svc).unwrap();

        let names: Vec<&str> = model
            .service("fabric:/rg/s")
            .unwrap()
            .metrics
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["CPU", CPU_CORES_METRIC, MEMORY_IN_MB_METRIC]);

        application.service_packages.clear();
        assert!(matches!(
            model.update_application(application, false),
            Err(ModelError::InvalidDescription(_))
        ));
        model.verify_consistency();
    }

    #[test]
    fn governance_added_later_reaches_existing_services() {
        let mut model = model_with_type();
        let mut application = app("fabric:/rg", 0, 0);
        application.capacity = None;
        application.service_packages = vec![ServicePackageDescription {
            name: "Pkg".into(),
            governance: None,
            container_images: vec![],
        }];
        model.update_application(application.clone(), false).unwrap();

        let mut svc = service("fabric:/rg/s", &["CPU"]);
        svc.application = Some("fabric:/rg".into());
        svc.service_package = Some("Pkg".into());
        model.update_service(svc).unwrap();
        let domain = model.domain_of_service("fabric:/rg/s").unwrap();
        assert_eq!(model.snapshot(domain).unwrap().metrics, vec!["CPU".to_string()]);

        application.service_packages[0].governance = Some(ResourceGovernancePolicy {
            cpu_cores: 2.0,
            memory_in_mb: 0,
            code_packages: vec![],
        });
        model.update_application(application.clone(), false).unwrap();
        let names: Vec<&str> = model
            .service("fabric:/rg/s")
            .unwrap()
            .metrics
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(names, vec!["CPU", CPU_CORES_METRIC, MEMORY_IN_MB_METRIC]);
        let domain = model.domain_of_service("fabric:/rg/s").unwrap();
        assert!(model.snapshot(domain).unwrap().metrics.contains(&CPU_CORES_METRIC.to_string()));
        model.verify_consistency();

        application.service_packages[0].governance = None;
        model.update_application(application, false).unwrap();
        assert_eq!(model.service("fabric:/rg/s").unwrap().metrics.len(), 1);
        let domain = model.domain_of_service("fabric:/rg/s").unwrap();
        assert_eq!(model.snapshot(domain).unwrap().metrics, vec!["CPU".to_string()]);
        model.verify_consistency();
    }

    #[test]
    fn snapshot_filters_capacities_to_domain_metrics() {
        let mut model = model_with_type();
        model.update_node(node("N2", &[("CPU", 10), ("Disk", 100)])).unwrap();
        model.update_node(node("N1", &[("CPU", 10)])).unwrap();
        model.update_service(service("A", &["CPU"])).unwrap();
        let domain = model.domain_of_service("A").unwrap();

        let snapshot = model.snapshot(domain).unwrap();
        let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["N1", "N2"]);
        assert!(snapshot.node("N2").unwrap().capacity("Disk").is_none());
        assert_eq!(snapshot.metrics, vec!["CPU".to_string()]);
        assert_eq!(snapshot.generation, model.generation(domain).unwrap());
    }
}
