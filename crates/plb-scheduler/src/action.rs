//! Scheduler action selection.
//!
//! One action per domain and refresh, re-derived from the domain analysis
//! every time. The only memory is the last pass of each action class,
//! used for the minimum intervals and to skip an action that already ran
//! against the same domain generation and loads without producing anything.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use plb_core::{PlbConfig, SchedulerActionKind};
use plb_placement::DomainAnalysis;

/// A finished pass of one action class on a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassRecord {
    pub generation: u64,
    pub load_stamp: u64,
    pub at: Instant,
    /// Whether the pass emitted at least one movement.
    pub produced: bool,
}

/// Per-domain memory of the selector.
#[derive(Debug, Clone, Default)]
pub struct DomainTiming {
    passes: BTreeMap<SchedulerActionKind, PassRecord>,
}

/// Placement and balancing variants share one record.
fn action_class(action: SchedulerActionKind) -> SchedulerActionKind {
    match action {
        SchedulerActionKind::NewReplicaPlacementWithMove => SchedulerActionKind::NewReplicaPlacement,
        SchedulerActionKind::QuickLoadBalancing => SchedulerActionKind::LoadBalancing,
        other => other,
    }
}

impl DomainTiming {
    pub fn record(
        &mut self,
        action: SchedulerActionKind,
        generation: u64,
        load_stamp: u64,
        at: Instant,
        produced: bool,
    ) {
        if action == SchedulerActionKind::NoActionNeeded || action.is_client_api() {
            return;
        }
        self.passes.insert(
            action_class(action),
            PassRecord {
                generation,
                load_stamp,
                at,
                produced,
            },
        );
    }

    pub fn last_pass(&self, action: SchedulerActionKind) -> Option<&PassRecord> {
        self.passes.get(&action_class(action))
    }

    fn interval_elapsed(&self, action: SchedulerActionKind, interval: Duration, now: Instant) -> bool {
        self.last_pass(action)
            .is_none_or(|p| now.saturating_duration_since(p.at) >= interval)
    }

    /// The action already ran against the same generation and loads and
    /// either found nothing or its movements are still young enough to be
    /// in flight.
    fn is_stalled(&self, action: SchedulerActionKind, ctx: &SelectorContext, config: &PlbConfig) -> bool {
        self.last_pass(action).is_some_and(|p| {
            p.generation == ctx.generation
                && p.load_stamp == ctx.load_stamp
                && (!p.produced || ctx.now.saturating_duration_since(p.at) < config.max_movement_execution_time)
        })
    }
}

/// Conditions the engine evaluates outside the domain snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SelectorContext {
    pub generation: u64,
    /// Advanced by every load report applied to the domain.
    pub load_stamp: u64,
    /// False while a topology change delay runs or the global movement
    /// throttle is exhausted.
    pub balancing_allowed: bool,
    pub now: Instant,
}

/// Pick the action for one domain.
pub fn select_action(
    analysis: &DomainAnalysis,
    config: &PlbConfig,
    timing: &DomainTiming,
    ctx: SelectorContext,
) -> SchedulerActionKind {
    let SelectorContext {
        balancing_allowed,
        now,
        ..
    } = ctx;

    if analysis.upgrade_in_progress
        && analysis.requested_relocations
        && !timing.is_stalled(SchedulerActionKind::Upgrade, &ctx, config)
    {
        return SchedulerActionKind::Upgrade;
    }

    if config.constraint_check_enabled
        && (analysis.violations > 0 || analysis.requested_relocations)
        && !timing.is_stalled(SchedulerActionKind::ConstraintCheck, &ctx, config)
    {
        if !timing.interval_elapsed(
            SchedulerActionKind::ConstraintCheck,
            config.min_constraint_check_interval,
            now,
        ) {
            return SchedulerActionKind::NoActionNeeded;
        }
        return SchedulerActionKind::ConstraintCheck;
    }

    if config.placement_enabled
        && analysis.needs_placement()
        && !timing.is_stalled(SchedulerActionKind::NewReplicaPlacement, &ctx, config)
    {
        if !timing.interval_elapsed(
            SchedulerActionKind::NewReplicaPlacement,
            config.min_placement_interval,
            now,
        ) {
            return SchedulerActionKind::NoActionNeeded;
        }
        return SchedulerActionKind::NewReplicaPlacement;
    }

    let upgrade_allows = !analysis.upgrade_in_progress || config.allow_balancing_during_application_upgrade;
    if config.balancing_enabled
        && balancing_allowed
        && upgrade_allows
        && !analysis.balance.is_balanced()
        && timing.interval_elapsed(SchedulerActionKind::LoadBalancing, config.min_load_balancing_interval, now)
        && !timing.is_stalled(SchedulerActionKind::LoadBalancing, &ctx, config)
    {
        let overloaded = analysis.balance.overloaded_nodes.len();
        if (1..=config.quick_balancing_node_limit).contains(&overloaded) {
            return SchedulerActionKind::QuickLoadBalancing;
        }
        return SchedulerActionKind::LoadBalancing;
    }

    SchedulerActionKind::NoActionNeeded
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use plb_placement::BalanceAnalysis;

    use super::*;

    fn ctx(generation: u64, now: Instant) -> SelectorContext {
        SelectorContext {
            generation,
            load_stamp: 0,
            balancing_allowed: true,
            now,
        }
    }

    fn imbalanced(overloaded: &[usize]) -> BalanceAnalysis {
        BalanceAnalysis {
            imbalanced_metrics: vec!["CPU".into()],
            overloaded_nodes: overloaded.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn priority_order() {
        let config = PlbConfig::default();
        let timing = DomainTiming::default();
        let now = Instant::now();
        let mut analysis = DomainAnalysis {
            violations: 1,
            missing_replicas: 1,
            balance: imbalanced(&[0]),
            ..Default::default()
        };
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::ConstraintCheck
        );
        analysis.upgrade_in_progress = true;
        analysis.requested_relocations = true;
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::Upgrade
        );
        analysis.upgrade_in_progress = false;
        analysis.requested_relocations = false;
        analysis.violations = 0;
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::NewReplicaPlacement
        );
        analysis.missing_replicas = 0;
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::QuickLoadBalancing
        );
        analysis.balance = imbalanced(&[0, 1, 2]);
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::LoadBalancing
        );
        analysis.balance = BalanceAnalysis::default();
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(1, now)),
            SchedulerActionKind::NoActionNeeded
        );
    }

    #[test]
    fn fruitless_pass_is_not_repeated_at_same_generation() {
        let config = PlbConfig::default();
        let mut timing = DomainTiming::default();
        let start = Instant::now();
        let analysis = DomainAnalysis {
            missing_replicas: 1,
            balance: imbalanced(&[0, 1, 2]),
            ..Default::default()
        };
        timing.record(SchedulerActionKind::NewReplicaPlacement, 4, 0, start, false);
        let later = start + Duration::from_secs(10);
        // Placement stalled at generation 4, so balancing runs instead.
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(4, later)),
            SchedulerActionKind::LoadBalancing
        );
        // A newer generation makes placement eligible again.
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(5, later)),
            SchedulerActionKind::NewReplicaPlacement
        );
    }

    #[test]
    fn balancing_waits_for_interval_and_permission() {
        let config = PlbConfig::default();
        let mut timing = DomainTiming::default();
        let start = Instant::now();
        let analysis = DomainAnalysis {
            balance: imbalanced(&[0, 1, 2]),
            ..Default::default()
        };
        timing.record(SchedulerActionKind::QuickLoadBalancing, 1, 0, start, true);
        let soon = start + Duration::from_secs(1);
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(2, soon)),
            SchedulerActionKind::NoActionNeeded
        );
        let later = start + config.min_load_balancing_interval;
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(2, later)),
            SchedulerActionKind::LoadBalancing
        );
        let blocked = SelectorContext {
            balancing_allowed: false,
            ..ctx(2, later)
        };
        assert_eq!(
            select_action(&analysis, &config, &timing, blocked),
            SchedulerActionKind::NoActionNeeded
        );
    }

    #[test]
    fn placement_interval_holds_back_lower_actions() {
        let mut config = PlbConfig::default();
        config.min_placement_interval = Duration::from_secs(30);
        let mut timing = DomainTiming::default();
        let start = Instant::now();
        timing.record(SchedulerActionKind::NewReplicaPlacementWithMove, 1, 0, start, true);
        let analysis = DomainAnalysis {
            missing_replicas: 2,
            balance: imbalanced(&[0]),
            ..Default::default()
        };
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(2, start + Duration::from_secs(5))),
            SchedulerActionKind::NoActionNeeded
        );
        assert_eq!(
            select_action(&analysis, &config, &timing, ctx(2, start + Duration::from_secs(31))),
            SchedulerActionKind::NewReplicaPlacement
        );
    }

    #[test]
    fn fruitless_balancing_reruns_after_load_drift() {
        let config = PlbConfig::default();
        let mut timing = DomainTiming::default();
        let start = Instant::now();
        let analysis = DomainAnalysis {
            balance: imbalanced(&[0]),
            ..Default::default()
        };
        timing.record(SchedulerActionKind::QuickLoadBalancing, 3, 7, start, false);
        let later = start + config.min_load_balancing_interval;
        assert_eq!(
            select_action(&analysis, &config, &timing, SelectorContext { load_stamp: 7, ..ctx(3, later) }),
            SchedulerActionKind::NoActionNeeded
        );
        assert_eq!(
            select_action(&analysis, &config, &timing, SelectorContext { load_stamp: 8, ..ctx(3, later) }),
            SchedulerActionKind::QuickLoadBalancing
        );
    }
}
