//! PlacementAndLoadBalancer: the engine facade.
//!
//! Updates from the failover authority are applied synchronously under a
//! short write lock on the cluster model. Optimization only happens in
//! `refresh`, which is split in three phases so the expensive middle one
//! runs without any lock held:
//!
//! - `begin_refresh` snapshots every domain and picks its action
//! - `RefreshPass::run` searches each domain, in parallel when enabled
//! - `end_refresh` drops passes whose domain changed meanwhile, verifies
//!   and emits the rest, and notifies the authority
//!
//! Lock order is config, then model, then scheduler state. The authority
//! is only ever called with no lock held.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use plb_autoscale::{AutoScaleAdvisor, AutoScaleError, ScaleDecision, ServiceUsage, governance_grows};
use plb_core::*;
use plb_metrics::{ClusterGauges, PlbStatistics, StatisticsAggregator, StatsStore, render_prometheus};
use plb_model::{
    ClusterModel, DomainId, DomainSnapshot, FailoverUnitUpdate, NodeChange, ServiceEntry,
};
use plb_placement::{Expr, SearchResult, UnplacedReport, analyze_snapshot, run_search, verify_movements};

use crate::action::{DomainTiming, SelectorContext, select_action};
use crate::authority::FailoverAuthority;
use crate::emitter::{EmitOutcome, MovementEmitter, drop_reason};
use crate::error::{SchedulerError, SchedulerResult};

/// Statistics snapshots kept in the history store.
const STATISTICS_HISTORY: usize = 1440;

/// Where an upgrading application stands in the governance safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCheckState {
    /// Some node hosting a governed package lacks room for the new limits.
    AwaitingHeadroom,
    /// The authority was told the upgrade may proceed.
    AwaitingAcknowledgement,
}

/// Mutable scheduling state guarded by one mutex.
#[derive(Default)]
pub(crate) struct SchedulerState {
    pub(crate) emitter: MovementEmitter,
    pub(crate) timings: HashMap<DomainId, DomainTiming>,
    pub(crate) in_flight: HashSet<DomainId>,
    pub(crate) advisor: AutoScaleAdvisor,
    pub(crate) safety_checks: BTreeMap<String, SafetyCheckState>,
    pub(crate) balancing_blocked_until: Option<Instant>,
    pub(crate) unplaced: BTreeMap<FailoverUnitId, Vec<UnplacedReport>>,
}

/// The placement and load-balancing engine.
pub struct PlacementAndLoadBalancer {
    pub(crate) config: RwLock<PlbConfig>,
    pub(crate) model: RwLock<ClusterModel>,
    pub(crate) authority: Arc<dyn FailoverAuthority>,
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) stats: StatisticsAggregator,
    store: Option<StatsStore>,
}

/// One domain's share of a refresh.
pub struct DomainPass {
    pub domain: DomainId,
    pub generation: u64,
    pub action: SchedulerActionKind,
    move_limit: usize,
    snapshot: DomainSnapshot,
    result: Option<SearchResult>,
}

impl DomainPass {
    fn run(&mut self, config: &PlbConfig) {
        if self.action == SchedulerActionKind::NoActionNeeded {
            return;
        }
        self.result = Some(run_search(&self.snapshot, config, self.action, self.move_limit));
    }
}

/// A refresh between `begin_refresh` and `end_refresh`.
pub struct RefreshPass {
    pub decision_id: DecisionId,
    config: PlbConfig,
    domains: Vec<DomainPass>,
    instance_updates: Vec<(String, u32)>,
    approved_upgrades: Vec<String>,
}

impl RefreshPass {
    /// Search every domain that has something to do.
    pub fn run(&mut self) {
        let config = &self.config;
        let busy = self
            .domains
            .iter()
            .filter(|d| d.action != SchedulerActionKind::NoActionNeeded)
            .count();
        if config.parallel_domains && busy > 1 {
            std::thread::scope(|scope| {
                for pass in &mut self.domains {
                    scope.spawn(move || pass.run(config));
                }
            });
        } else {
            for pass in &mut self.domains {
                pass.run(config);
            }
        }
    }

    pub fn actions(&self) -> BTreeMap<DomainId, SchedulerActionKind> {
        self.domains.iter().map(|d| (d.domain, d.action)).collect()
    }
}

/// What one refresh did.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub decision_id: DecisionId,
    /// Action taken per domain; an upgraded label when the search changed it.
    pub actions: BTreeMap<DomainId, SchedulerActionKind>,
    pub emitted: FailoverUnitMovementTable,
    pub dropped: Vec<DroppedMovement>,
    /// Domains whose pass was thrown away because they changed meanwhile.
    pub abandoned: usize,
}

impl RefreshReport {
    pub fn action_of(&self, domain: DomainId) -> Option<SchedulerActionKind> {
        self.actions.get(&domain).copied()
    }

    /// Whether every domain was quiescent.
    pub fn is_idle(&self) -> bool {
        self.emitted.is_empty() && self.actions.values().all(|a| *a == SchedulerActionKind::NoActionNeeded)
    }
}

impl PlacementAndLoadBalancer {
    pub fn new(config: PlbConfig, authority: Arc<dyn FailoverAuthority>) -> Self {
        Self {
            config: RwLock::new(config),
            model: RwLock::new(ClusterModel::new()),
            authority,
            state: Mutex::new(SchedulerState::default()),
            stats: StatisticsAggregator::new(),
            store: None,
        }
    }

    /// Persist statistics snapshots to `store` on every statistics interval.
    pub fn with_statistics_store(mut self, store: StatsStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> PlbConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: PlbConfig) -> SchedulerResult<()> {
        config
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        *self.config.write() = config;
        info!("configuration updated");
        Ok(())
    }

    /// Read access to the cluster model.
    pub fn with_model<R>(&self, f: impl FnOnce(&ClusterModel) -> R) -> R {
        f(&self.model.read())
    }

    // ── Updates ────────────────────────────────────────────────────

    pub fn update_node(&self, node: NodeDescription) -> SchedulerResult<NodeChange> {
        let config = self.config.read();
        let node_id = node.node_id.clone();
        let change = self.model.write().update_node(node)?;
        let delay = match change {
            NodeChange::WentDown => Some(config.balancing_delay_after_node_down),
            NodeChange::Added | NodeChange::CameUp => Some(config.balancing_delay_after_new_node),
            NodeChange::Changed | NodeChange::Unchanged => None,
        };
        if let Some(delay) = delay {
            let until = Instant::now() + delay;
            let mut state = self.state.lock();
            state.balancing_blocked_until = Some(state.balancing_blocked_until.map_or(until, |u| u.max(until)));
            info!(node = %node_id, ?change, delay_ms = delay.as_millis() as u64, "topology changed, balancing delayed");
        }
        Ok(change)
    }

    pub fn update_service_type(&self, service_type: ServiceTypeDescription) {
        self.model.write().update_service_type(service_type);
    }

    pub fn delete_service_type(&self, name: &str) -> bool {
        self.model.write().delete_service_type(name)
    }

    /// Insert or replace a service. A forced update skips expression and
    /// scaling policy validation and drops an unsupported affinity chain
    /// instead of failing.
    pub fn update_service(&self, service: ServiceDescription, force_update: bool) -> SchedulerResult<()> {
        if !force_update {
            validate_placement_constraint(&service.placement_constraints)?;
            validate_scaling_policies(&service)?;
        }

        let name = service.name.clone();
        let scaled = !service.auto_scaling_policies.is_empty();
        let partitions = service.partition_count;
        let previous_partitions = {
            let mut model = self.model.write();
            let previous = model.service(&name).map(|s| s.description.partition_count);
            match model.update_service(service.clone()) {
                Ok(_) => {}
                Err(plb_model::ModelError::AffinityChainNotSupported(parent)) if force_update => {
                    warn!(service = %name, %parent, "affinity chain not supported, dropping affinity");
                    let mut service = service;
                    service.affinity = None;
                    model.update_service(service)?;
                }
                Err(e) => return Err(e.into()),
            }
            previous
        };

        let now = Instant::now();
        let mut state = self.state.lock();
        if scaled {
            state.advisor.track(&name, now);
            if previous_partitions.is_some_and(|p| p != partitions) {
                state.advisor.on_partition_count_changed(&name, now);
            }
        } else {
            state.advisor.forget(&name);
        }
        debug!(service = %name, partitions, force_update, "service updated");
        Ok(())
    }

    pub fn delete_service(&self, name: &str) -> bool {
        let (deleted, units) = {
            let mut model = self.model.write();
            let units: Vec<FailoverUnitId> = model
                .service(name)
                .map(|s| s.failover_units.iter().copied().collect())
                .unwrap_or_default();
            (model.delete_service(name), units)
        };
        if deleted {
            let mut state = self.state.lock();
            state.advisor.forget(name);
            for id in &units {
                state.emitter.forget(id);
                state.unplaced.remove(id);
            }
        }
        deleted
    }

    pub fn update_failover_unit(&self, fu: FailoverUnitDescription) -> SchedulerResult<FailoverUnitUpdate> {
        let id = fu.id;
        let outcome = self.model.write().update_failover_unit(fu)?;
        if outcome != FailoverUnitUpdate::Unchanged {
            let mut state = self.state.lock();
            if let Some(pending) = state.emitter.resolve(&id) {
                debug!(failover_unit = %id, action = %pending.action, "failover unit changed, outstanding movement settled");
            }
            state.unplaced.remove(&id);
        }
        Ok(outcome)
    }

    pub fn delete_failover_unit(&self, service_name: &str, id: &FailoverUnitId) -> bool {
        let deleted = self.model.write().delete_failover_unit(service_name, id);
        if deleted {
            let mut state = self.state.lock();
            state.emitter.forget(id);
            state.unplaced.remove(id);
        }
        deleted
    }

    pub fn update_load_or_move_cost(&self, report: &LoadOrMoveCostDescription) -> bool {
        let interrupt = self.config.read().interrupt_balancing_for_load_updates;
        self.model.write().update_load_or_move_cost(report, interrupt)
    }

    /// Insert or replace an application. Unless forced, a reservation the
    /// cluster cannot hold is rejected.
    pub fn update_application(&self, application: ApplicationDescription, force_update: bool) -> SchedulerResult<()> {
        let name = application.name.clone();
        let upgrading = application.upgrade_in_progress;
        let grown: Vec<String> = {
            let mut model = self.model.write();
            let update = model.update_application(application.clone(), force_update)?;
            match update.previous {
                Some(previous) if upgrading => application
                    .service_packages
                    .iter()
                    .filter(|pkg| {
                        let old = previous
                            .service_packages
                            .iter()
                            .find(|p| p.name == pkg.name)
                            .and_then(|p| p.governance.as_ref());
                        governance_grows(old, pkg.governance.as_ref())
                    })
                    .map(|pkg| pkg.name.clone())
                    .collect(),
                _ => Vec::new(),
            }
        };

        let mut state = self.state.lock();
        if !upgrading {
            state.safety_checks.remove(&name);
        } else if !grown.is_empty() && !state.safety_checks.contains_key(&name) {
            info!(application = %name, packages = ?grown, "governance grows during upgrade, tracking safety check");
            state.safety_checks.insert(name, SafetyCheckState::AwaitingHeadroom);
        }
        Ok(())
    }

    pub fn delete_application(&self, name: &str) -> SchedulerResult<bool> {
        let deleted = self.model.write().delete_application(name)?;
        self.state.lock().safety_checks.remove(name);
        Ok(deleted)
    }

    pub fn update_cluster_upgrade(&self, in_progress: bool, completed_upgrade_domains: BTreeSet<String>) -> bool {
        self.model
            .write()
            .update_cluster_upgrade(in_progress, completed_upgrade_domains)
    }

    pub fn reset_partition_load(
        &self,
        id: &FailoverUnitId,
        service_name: &str,
        is_stateful: bool,
    ) -> SchedulerResult<()> {
        self.model
            .write()
            .reset_partition_load(id, service_name, is_stateful)?;
        Ok(())
    }

    pub fn update_available_images_per_node(&self, node_id: &str, images: impl IntoIterator<Item = String>) {
        self.model
            .write()
            .update_available_images(node_id, images.into_iter().collect());
    }

    // ── Authority notifications ────────────────────────────────────

    /// The authority did not execute a movement it received.
    pub fn on_dropped_plb_movement(&self, id: &FailoverUnitId, reason: PlbMovementIgnoredReason) {
        self.on_dropped_plb_movements(std::slice::from_ref(id), reason);
    }

    pub fn on_dropped_plb_movements(&self, ids: &[FailoverUnitId], reason: PlbMovementIgnoredReason) {
        {
            let mut state = self.state.lock();
            for id in ids {
                state.emitter.resolve(id);
            }
        }
        self.stats.record_drops(reason, ids.len() as u64);
        debug!(count = ids.len(), %reason, "authority dropped movements");
    }

    pub fn on_execute_plb_movement(&self, id: &FailoverUnitId) {
        if self.state.lock().emitter.resolve(id).is_some() {
            debug!(failover_unit = %id, "movement executed");
        }
    }

    /// Withhold emission for the configured backoff. Computation continues.
    pub fn on_fm_busy(&self) {
        let config = self.config.read();
        self.state.lock().emitter.on_fm_busy(Instant::now(), &config);
        warn!(backoff_ms = config.fm_busy_backoff.as_millis() as u64, "failover manager busy");
    }

    pub fn on_safety_check_acknowledged(&self, application: &str) {
        if self.state.lock().safety_checks.remove(application).is_some() {
            info!(%application, "upgrade safety check acknowledged");
        }
    }

    pub fn set_cluster_paused(&self, paused: bool) {
        self.state.lock().emitter.set_cluster_paused(paused);
        info!(paused, "cluster pause changed");
    }

    pub fn safety_check_state(&self, application: &str) -> Option<SafetyCheckState> {
        self.state.lock().safety_checks.get(application).copied()
    }

    // ── Auto-scaling ───────────────────────────────────────────────

    pub fn pending_auto_scaling_repartitions(&self) -> BTreeMap<String, i32> {
        self.state.lock().advisor.pending_repartitions().clone()
    }

    pub fn partition_count_change_for_service(&self, service: &str) -> Option<i32> {
        self.state.lock().advisor.partition_count_change(service)
    }

    pub fn take_pending_repartitions(&self) -> BTreeMap<String, i32> {
        self.state.lock().advisor.take_pending()
    }

    pub fn clear_pending_repartitions(&self) {
        self.state.lock().advisor.clear_pending();
    }

    pub fn induce_repartitioning_failure(&self, service: &str, reason: &str) {
        self.state.lock().advisor.induce_repartitioning_failure(service, reason);
        self.stats.record_repartition_failure();
    }

    /// Repartition failures reported since the last call.
    pub fn take_repartition_failures(&self) -> Vec<AutoScaleError> {
        self.state.lock().advisor.take_failures()
    }

    // ── Refresh ────────────────────────────────────────────────────

    /// Snapshot every idle domain and select its action.
    pub fn begin_refresh(&self, now: Instant) -> RefreshPass {
        let config = self.config.read().clone();
        let model = self.model.read();
        let mut state = self.state.lock();

        let instance_updates = evaluate_auto_scaling(&model, &mut state.advisor, now);
        let approved_upgrades = evaluate_safety_checks(&model, &mut state.safety_checks);

        let throttle = state.emitter.throttle_remaining(&config, now);
        let topology_settled = state.balancing_blocked_until.is_none_or(|until| now >= until);
        let balancing_allowed = topology_settled && throttle > 0;

        let mut domains = Vec::new();
        for domain in model.domain_ids() {
            if state.in_flight.contains(&domain) {
                debug!(%domain, "domain pass still in flight, skipping");
                continue;
            }
            let Some(snapshot) = model.snapshot(domain) else {
                continue;
            };
            let generation = snapshot.generation;
            let analysis = analyze_snapshot(&snapshot, &config);
            let timing = state.timings.entry(domain).or_default();
            let action = select_action(
                &analysis,
                &config,
                timing,
                SelectorContext {
                    generation,
                    load_stamp: snapshot.load_stamp,
                    balancing_allowed,
                    now,
                },
            );
            debug!(
                %domain,
                generation,
                %action,
                violations = analysis.violations,
                missing = analysis.missing_replicas,
                extra = analysis.extra_replicas,
                "action selected"
            );
            state.in_flight.insert(domain);
            domains.push(DomainPass {
                domain,
                generation,
                action,
                move_limit: usize::MAX,
                snapshot,
                result: None,
            });
        }
        share_throttle(&mut domains, throttle);
        let live: BTreeSet<DomainId> = model.domain_ids().into_iter().collect();
        state.timings.retain(|d, _| live.contains(d));

        RefreshPass {
            decision_id: Uuid::new_v4(),
            config,
            domains,
            instance_updates,
            approved_upgrades,
        }
    }

    /// Verify and emit the results of a pass, then notify the authority.
    pub fn end_refresh(&self, pass: RefreshPass, now: Instant) -> RefreshReport {
        let RefreshPass {
            decision_id,
            config,
            domains,
            instance_updates,
            approved_upgrades,
        } = pass;
        let mut report = RefreshReport {
            decision_id,
            ..Default::default()
        };
        let mut outcome = EmitOutcome::default();

        let gauges = {
            let model = self.model.read();
            let mut state = self.state.lock();
            for pass in domains {
                state.in_flight.remove(&pass.domain);
                report.actions.insert(pass.domain, pass.action);
                let Some(result) = pass.result else {
                    continue;
                };

                if model.generation(pass.domain) != Some(pass.generation) {
                    report.abandoned += 1;
                    debug!(
                        domain = %pass.domain,
                        generation = pass.generation,
                        candidates = result.movements.len(),
                        "domain changed during refresh, abandoning pass"
                    );
                    for (id, movement) in &result.movements {
                        let reason = match model.failover_unit(id) {
                            None => PlbMovementIgnoredReason::FailoverUnitNotFound,
                            Some(entry) if entry.description.version != movement.version => {
                                PlbMovementIgnoredReason::VersionMismatch
                            }
                            Some(_) => PlbMovementIgnoredReason::FailoverUnitIsChanging,
                        };
                        state.emitter.reject(&mut outcome, *id, reason, decision_id, &config);
                    }
                    continue;
                }

                report.actions.insert(pass.domain, result.action);
                if result.action.is_placement() {
                    for fu in &pass.snapshot.failover_units {
                        state.unplaced.remove(&fu.id);
                    }
                    for unplaced in result.unplaced {
                        state.unplaced.entry(unplaced.failover_unit_id).or_default().push(unplaced);
                    }
                }
                for unfixed in &result.unfixed {
                    warn!(
                        domain = %pass.domain,
                        failover_unit = %unfixed.failover_unit_id,
                        node = %unfixed.node_id,
                        violation = %unfixed.violation,
                        "constraint violation could not be fixed"
                    );
                }

                let produced = !result.movements.is_empty();
                let mut candidates = result.movements;
                for (id, violation) in verify_movements(&pass.snapshot, &config, &candidates) {
                    warn!(domain = %pass.domain, failover_unit = %id, %violation, "movement failed the emission check");
                    candidates.remove(&id);
                    state
                        .emitter
                        .reject(&mut outcome, id, drop_reason(&violation), decision_id, &config);
                }
                let emitted = state.emitter.emit(candidates, &model, &config, now, decision_id);
                if result.action.is_balancing() {
                    state.emitter.record_balancing(emitted.emitted.len(), now);
                }
                state
                    .timings
                    .entry(pass.domain)
                    .or_default()
                    .record(result.action, pass.generation, pass.snapshot.load_stamp, now, produced);
                info!(
                    domain = %pass.domain,
                    action = %result.action,
                    emitted = emitted.emitted.len(),
                    dropped = emitted.dropped.len(),
                    score = result.final_score,
                    "domain pass finished"
                );
                outcome.merge(emitted);
            }
            cluster_gauges(&model, &state, &config)
        };

        self.stats.set_gauges(gauges);
        self.stats.record_refresh(report.abandoned as u64);
        self.notify(&outcome, decision_id);
        for (service, target) in &instance_updates {
            self.authority.update_target_replica_count(service, *target);
        }
        for application in &approved_upgrades {
            self.authority.update_app_upgrade_safety_check(application);
        }

        report.emitted = outcome.emitted;
        report.dropped = outcome.dropped;
        report
    }

    /// Run one full refresh cycle.
    pub fn refresh(&self, now: Instant) -> RefreshReport {
        let mut pass = self.begin_refresh(now);
        pass.run();
        self.end_refresh(pass, now)
    }

    /// Record statistics and hand an emission outcome to the authority.
    pub(crate) fn notify(&self, outcome: &EmitOutcome, decision_id: DecisionId) {
        for movement in outcome.emitted.values() {
            self.stats.record_movement(movement);
        }
        let mut by_reason: BTreeMap<u16, (PlbMovementIgnoredReason, u64)> = BTreeMap::new();
        for dropped in &outcome.dropped {
            by_reason.entry(dropped.reason.code()).or_insert((dropped.reason, 0)).1 += 1;
        }
        for (reason, count) in by_reason.into_values() {
            self.stats.record_drops(reason, count);
        }
        if !outcome.emitted.is_empty() {
            self.authority.process_movements(&outcome.emitted, decision_id);
        }
        if !outcome.dropped.is_empty() {
            self.authority.on_movements_dropped(&outcome.dropped);
        }
    }

    // ── Statistics ─────────────────────────────────────────────────

    pub fn statistics(&self) -> PlbStatistics {
        self.stats.snapshot()
    }

    /// Current statistics in Prometheus text format.
    pub fn render_metrics(&self) -> String {
        render_prometheus(&self.statistics())
    }

    /// Write the current statistics to the history store, if one is set.
    pub fn persist_statistics(&self) -> SchedulerResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.put(&self.statistics())?;
        store.prune(STATISTICS_HISTORY)?;
        Ok(())
    }

    /// Refresh on every interval until `shutdown` flips. Each refresh runs
    /// on the blocking pool.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            refresh_ms = self.config.read().refresh_interval.as_millis() as u64,
            "PLB refresh loop started"
        );
        let mut last_persist = Instant::now();
        loop {
            let (interval, statistics_interval) = {
                let config = self.config.read();
                (config.refresh_interval, config.statistics_interval)
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let engine = Arc::clone(&self);
                    let report = match tokio::task::spawn_blocking(move || engine.refresh(Instant::now())).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!(error = %e, "refresh task failed");
                            continue;
                        }
                    };
                    if !report.emitted.is_empty() || !report.dropped.is_empty() {
                        debug!(
                            decision = %report.decision_id,
                            emitted = report.emitted.len(),
                            dropped = report.dropped.len(),
                            abandoned = report.abandoned,
                            "refresh finished"
                        );
                    }
                    if last_persist.elapsed() >= statistics_interval {
                        last_persist = Instant::now();
                        if let Err(e) = self.persist_statistics() {
                            error!(error = %e, "failed to persist statistics");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("PLB refresh loop shutting down");
                    if let Err(e) = self.persist_statistics() {
                        error!(error = %e, "failed to persist statistics");
                    }
                    break;
                }
            }
        }
    }
}

fn validate_placement_constraint(expression: &str) -> SchedulerResult<()> {
    if expression.trim().is_empty() {
        return Ok(());
    }
    Expr::parse(expression).map_err(|source| SchedulerError::InvalidPlacementConstraint {
        expression: expression.to_string(),
        source,
    })?;
    Ok(())
}

fn validate_scaling_policies(service: &ServiceDescription) -> SchedulerResult<()> {
    let invalid = |reason: &str| SchedulerError::InvalidScalingPolicy {
        service: service.name.clone(),
        reason: reason.to_string(),
    };
    for policy in &service.auto_scaling_policies {
        let trigger = &policy.trigger;
        if trigger.lower_load_threshold > trigger.upper_load_threshold {
            return Err(invalid("lower load threshold is above the upper threshold"));
        }
        let (min, max, increment) = match policy.mechanism {
            AutoScalingMechanism::InstanceCount {
                min_instance_count,
                max_instance_count,
                scale_increment,
            } => {
                if service.is_stateful {
                    return Err(invalid("instance count scaling needs a stateless service"));
                }
                (min_instance_count, max_instance_count, scale_increment)
            }
            AutoScalingMechanism::AddRemoveIncrementalNamedPartition {
                min_partition_count,
                max_partition_count,
                scale_increment,
            } => (min_partition_count, max_partition_count, scale_increment),
        };
        if min == 0 {
            return Err(invalid("minimum count must be positive"));
        }
        if max >= 0 && (max as u32) < min {
            return Err(invalid("maximum count is below the minimum"));
        }
        if increment == 0 {
            return Err(invalid("scale increment must be positive"));
        }
    }
    Ok(())
}

/// Split the remaining balancing quota across the domains about to balance.
/// A domain left without quota does not balance this round.
fn share_throttle(domains: &mut [DomainPass], remaining: usize) {
    let balancing: Vec<usize> = (0..domains.len())
        .filter(|i| domains[*i].action.is_balancing())
        .collect();
    if balancing.is_empty() {
        return;
    }
    let share = remaining / balancing.len();
    let extra = remaining % balancing.len();
    for (k, i) in balancing.into_iter().enumerate() {
        let quota = share + usize::from(k < extra);
        if quota == 0 {
            domains[i].action = SchedulerActionKind::NoActionNeeded;
        } else {
            domains[i].move_limit = quota;
        }
    }
}

/// Trigger-metric usage of an auto-scaled service, or `None` without data.
fn service_usage(
    model: &ClusterModel,
    service: &ServiceEntry,
    policy: &AutoScalingPolicy,
    node_count: u32,
) -> Option<ServiceUsage> {
    let metric = policy.trigger.metric_name.as_str();
    let scale = if metric == CPU_CORES_METRIC { CPU_CORES_SCALE } else { 1.0 };
    let stateful = service.description.is_stateful;

    let mut partition_loads = Vec::new();
    let mut instance_loads = Vec::new();
    let mut instance_count = 0;
    for fu in service.failover_units.iter().filter_map(|id| model.failover_unit(id)) {
        let loads: Vec<f64> = fu
            .description
            .replicas
            .iter()
            .filter(|r| r.is_healthy())
            .filter(|r| !stateful || !policy.trigger.use_only_primary_load || r.role == ReplicaRole::Primary)
            .map(|r| fu.loads.load(&service.metrics, stateful, metric, r.role, &r.node_id) as f64 / scale)
            .collect();
        if loads.is_empty() {
            continue;
        }
        instance_count = instance_count.max(loads.len() as u32);
        partition_loads.push(loads.iter().sum::<f64>() / loads.len() as f64);
        instance_loads.extend(loads);
    }
    if partition_loads.is_empty() {
        return None;
    }

    let samples = match policy.mechanism {
        AutoScalingMechanism::InstanceCount { .. } => &instance_loads,
        AutoScalingMechanism::AddRemoveIncrementalNamedPartition { .. } => &partition_loads,
    };
    let target = service.description.target_replica_set_size;
    Some(ServiceUsage {
        service: service.description.name.clone(),
        average_load: samples.iter().sum::<f64>() / samples.len() as f64,
        partition_count: service.description.partition_count,
        instance_count: if target > 0 { target as u32 } else { instance_count },
        node_count,
    })
}

/// Run the auto-scale advisor; returns instance count changes to report.
fn evaluate_auto_scaling(model: &ClusterModel, advisor: &mut AutoScaleAdvisor, now: Instant) -> Vec<(String, u32)> {
    let node_count = model.nodes().filter(|n| n.accepts_replicas()).count() as u32;
    let mut updates = Vec::new();
    for service in model.services() {
        for policy in &service.description.auto_scaling_policies {
            let Some(usage) = service_usage(model, service, policy, node_count) else {
                continue;
            };
            if let ScaleDecision::Instances(target) = advisor.evaluate(policy, &usage, now) {
                updates.push((usage.service, target));
            }
        }
    }
    updates
}

/// Governed CPU (millicores) and memory in use per node: the governance of
/// every distinct package with a healthy replica there.
pub(crate) fn governance_usage(model: &ClusterModel) -> BTreeMap<NodeId, (i64, i64)> {
    let mut hosted: BTreeSet<(NodeId, plb_model::ServicePackageId)> = BTreeSet::new();
    for service in model.services() {
        let Some(package) = service.service_package else {
            continue;
        };
        for fu in service.failover_units.iter().filter_map(|id| model.failover_unit(id)) {
            for replica in fu.description.replicas.iter().filter(|r| r.is_healthy()) {
                hosted.insert((replica.node_id.clone(), package));
            }
        }
    }
    let mut usage: BTreeMap<NodeId, (i64, i64)> = BTreeMap::new();
    for (node, package) in hosted {
        let Some(policy) = model
            .service_package(package)
            .and_then(|p| p.description.governance.as_ref())
            .filter(|g| g.is_governed())
        else {
            continue;
        };
        let entry = usage.entry(node).or_insert((0, 0));
        entry.0 += (policy.cpu_cores * CPU_CORES_SCALE).round() as i64;
        entry.1 += policy.memory_in_mb as i64;
    }
    usage
}

/// Approve upgrading applications whose hosting nodes all have room for
/// the new governance. Returns the applications to report.
fn evaluate_safety_checks(model: &ClusterModel, checks: &mut BTreeMap<String, SafetyCheckState>) -> Vec<String> {
    if !checks.values().any(|s| *s == SafetyCheckState::AwaitingHeadroom) {
        return Vec::new();
    }
    let usage = governance_usage(model);
    let mut approved = Vec::new();
    for (application, check) in checks.iter_mut() {
        if *check != SafetyCheckState::AwaitingHeadroom {
            continue;
        }
        let Some(app) = model.application(application) else {
            continue;
        };
        let mut nodes: BTreeSet<&str> = BTreeSet::new();
        for service in app.services.iter().filter_map(|s| model.service_by_id(*s)) {
            for fu in service.failover_units.iter().filter_map(|id| model.failover_unit(id)) {
                nodes.extend(fu.description.replicas.iter().filter(|r| r.is_healthy()).map(|r| r.node_id.as_str()));
            }
        }
        let fits = nodes.iter().all(|node_id| {
            let Some(node) = model.node(node_id) else {
                return true;
            };
            let (cpu, memory) = usage.get(*node_id).copied().unwrap_or((0, 0));
            node.capacities.get(CPU_CORES_METRIC).is_none_or(|c| cpu <= *c)
                && node.capacities.get(MEMORY_IN_MB_METRIC).is_none_or(|c| memory <= *c)
        });
        if fits {
            info!(%application, nodes = nodes.len(), "governance headroom available, upgrade may proceed");
            *check = SafetyCheckState::AwaitingAcknowledgement;
            approved.push(application.clone());
        }
    }
    approved
}

fn cluster_gauges(model: &ClusterModel, state: &SchedulerState, config: &PlbConfig) -> ClusterGauges {
    let usage = governance_usage(model);
    let mut gauges = ClusterGauges {
        nodes: model.node_count() as u64,
        up_nodes: model.nodes().filter(|n| n.is_up).count() as u64,
        services: model.service_count() as u64,
        failover_units: model.failover_unit_count() as u64,
        domains: model.domain_ids().len() as u64,
        governed_service_packages: model
            .service_packages()
            .filter(|p| p.description.governance.as_ref().is_some_and(|g| g.is_governed()))
            .count() as u64,
        cpu_cores_used: usage.values().map(|(cpu, _)| *cpu as f64).sum::<f64>() / CPU_CORES_SCALE,
        memory_in_mb_used: usage.values().map(|(_, mem)| *mem).sum(),
        defragmentation_metrics: config.defragmentation_metrics.values().filter(|v| **v).count() as u64,
        pending_repartitions: state.advisor.pending_repartitions().len() as u64,
        unplaced_replicas: state.unplaced.values().map(|r| r.len() as u64).sum(),
        ..Default::default()
    };
    for node in model.nodes().filter(|n| n.is_up) {
        gauges.cpu_cores_capacity += node.capacities.get(CPU_CORES_METRIC).copied().unwrap_or(0) as f64 / CPU_CORES_SCALE;
        gauges.memory_in_mb_capacity += node.capacities.get(MEMORY_IN_MB_METRIC).copied().unwrap_or(0);
    }
    for service in model.services() {
        for policy in &service.description.auto_scaling_policies {
            match policy.mechanism {
                AutoScalingMechanism::InstanceCount { .. } => gauges.instance_scaled_services += 1,
                AutoScalingMechanism::AddRemoveIncrementalNamedPartition { .. } => {
                    gauges.partition_scaled_services += 1
                }
            }
        }
    }
    gauges
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::authority::RecordingAuthority;

    use super::*;

    fn node(id: &str) -> NodeDescription {
        NodeDescription {
            node_id: id.into(),
            fault_domain: format!("fd:/{id}"),
            upgrade_domain: format!("ud{id}"),
            properties: BTreeMap::new(),
            capacities: BTreeMap::new(),
            is_up: true,
            deactivation: None,
        }
    }

    fn stateless_service(name: &str) -> ServiceDescription {
        ServiceDescription {
            name: name.into(),
            service_type: "T".into(),
            application: None,
            service_package: None,
            is_stateful: false,
            placement_constraints: String::new(),
            affinity: None,
            metrics: vec![],
            default_move_cost: MoveCost::Low,
            partition_count: 1,
            target_replica_set_size: 1,
            auto_scaling_policies: vec![],
        }
    }

    fn engine() -> (PlacementAndLoadBalancer, Arc<RecordingAuthority>) {
        let authority = Arc::new(RecordingAuthority::new());
        let engine = PlacementAndLoadBalancer::new(PlbConfig::default(), authority.clone());
        engine.update_service_type(ServiceTypeDescription {
            name: "T".into(),
            blocked_nodes: Default::default(),
        });
        (engine, authority)
    }

    #[test]
    fn invalid_constraint_is_rejected_unless_forced() {
        let (engine, _) = engine();
        let mut service = stateless_service("fabric:/svc");
        service.placement_constraints = "NodeType == ".into();
        let err = engine.update_service(service.clone(), false).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidPlacementConstraint { .. }));
        assert!(engine.with_model(|m| m.service("fabric:/svc").is_none()));

        engine.update_service(service, true).unwrap();
        assert!(engine.with_model(|m| m.service("fabric:/svc").is_some()));
    }

    #[test]
    fn scaling_policy_validation() {
        let (engine, _) = engine();
        let mut service = stateless_service("fabric:/svc");
        service.auto_scaling_policies.push(AutoScalingPolicy {
            trigger: AutoScalingTrigger {
                metric_name: "M".into(),
                lower_load_threshold: 5.0,
                upper_load_threshold: 1.0,
                scale_interval_secs: 1,
                use_only_primary_load: false,
            },
            mechanism: AutoScalingMechanism::InstanceCount {
                min_instance_count: 1,
                max_instance_count: -1,
                scale_increment: 1,
            },
        });
        assert!(matches!(
            engine.update_service(service.clone(), false),
            Err(SchedulerError::InvalidScalingPolicy { .. })
        ));
        service.auto_scaling_policies[0].trigger.lower_load_threshold = 0.5;
        engine.update_service(service, false).unwrap();
    }

    #[test]
    fn unknown_service_type_is_a_model_error() {
        let (engine, _) = engine();
        let mut service = stateless_service("fabric:/svc");
        service.service_type = "Missing".into();
        assert!(matches!(
            engine.update_service(service, false),
            Err(SchedulerError::Model(plb_model::ModelError::UnknownServiceType(_)))
        ));
    }

    #[test]
    fn node_events_delay_balancing() {
        let (engine, _) = engine();
        assert_eq!(engine.update_node(node("N1")).unwrap(), NodeChange::Added);
        let blocked = engine.state.lock().balancing_blocked_until.unwrap();
        assert!(blocked > Instant::now());
        assert_eq!(engine.update_node(node("N1")).unwrap(), NodeChange::Unchanged);
    }

    #[test]
    fn share_throttle_splits_quota() {
        let (engine, _) = engine();
        for i in 0..3 {
            let mut service = stateless_service(&format!("fabric:/svc{i}"));
            service.metrics = vec![ServiceMetric::new(&format!("M{i}"), 1.0, 1, 1)];
            engine.update_service(service, false).unwrap();
        }
        let snapshots: Vec<DomainSnapshot> = engine.with_model(|m| {
            m.domain_ids().into_iter().filter_map(|d| m.snapshot(d)).collect()
        });
        assert_eq!(snapshots.len(), 3);
        let mut domains: Vec<DomainPass> = snapshots
            .into_iter()
            .map(|snapshot| DomainPass {
                domain: snapshot.domain_id,
                generation: snapshot.generation,
                action: SchedulerActionKind::LoadBalancing,
                move_limit: usize::MAX,
                snapshot,
                result: None,
            })
            .collect();
        share_throttle(&mut domains, 2);
        let limits: Vec<(SchedulerActionKind, usize)> = domains.iter().map(|d| (d.action, d.move_limit)).collect();
        assert_eq!(limits[0], (SchedulerActionKind::LoadBalancing, 1));
        assert_eq!(limits[1], (SchedulerActionKind::LoadBalancing, 1));
        assert_eq!(limits[2].0, SchedulerActionKind::NoActionNeeded);
    }

    #[test]
    fn statistics_round_trip_through_store() {
        let authority = Arc::new(RecordingAuthority::new());
        let store = StatsStore::open_in_memory().unwrap();
        let engine =
            PlacementAndLoadBalancer::new(PlbConfig::default(), authority).with_statistics_store(store.clone());
        engine.update_node(node("N1")).unwrap();
        engine.refresh(Instant::now());
        engine.persist_statistics().unwrap();
        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.refreshes, 1);
        assert_eq!(latest.gauges.nodes, 1);
        assert!(engine.render_metrics().contains("plb_refreshes_total 1\n"));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let (engine, _) = engine();
        let mut config = PlbConfig::default();
        config.refresh_interval = std::time::Duration::from_millis(10);
        engine.update_config(config).unwrap();
        let engine = Arc::new(engine);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.run(rx).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(engine.statistics().refreshes >= 1);
    }
}
