//! Auto-scale advisor: threshold-driven partition and instance proposals.
//!
//! The engine feeds one `ServiceUsage` per auto-scaled service and refresh;
//! the advisor keeps per-service cooldown state, the queue of pending
//! repartitions the failover authority has not consumed yet, and the
//! repartition failures the authority reported.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use plb_core::{AutoScalingMechanism, AutoScalingPolicy};

use crate::error::AutoScaleError;

/// Aggregated trigger-metric usage of one service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceUsage {
    pub service: String,
    /// Mean load per partition for partition scaling, per instance for
    /// instance scaling.
    pub average_load: f64,
    pub partition_count: u32,
    pub instance_count: u32,
    /// Bound for an unbounded (`-1`) maximum instance count.
    pub node_count: u32,
}

/// A scaling decision for a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    NoChange,
    /// Signed change of the partition count.
    Partitions(i32),
    /// New instance count of every partition.
    Instances(u32),
}

struct ScaleState {
    last_scale: Instant,
    /// Partition delta proposed and not yet applied by the authority.
    in_flight: Option<i32>,
}

#[derive(Default)]
pub struct AutoScaleAdvisor {
    states: HashMap<String, ScaleState>,
    pending: BTreeMap<String, i32>,
    failures: Vec<AutoScaleError>,
}

impl AutoScaleAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the scale interval clock of a service. No-op when tracked.
    pub fn track(&mut self, service: &str, now: Instant) {
        self.states.entry(service.to_string()).or_insert(ScaleState {
            last_scale: now,
            in_flight: None,
        });
    }

    pub fn forget(&mut self, service: &str) {
        self.states.remove(service);
        self.pending.remove(service);
    }

    pub fn is_tracked(&self, service: &str) -> bool {
        self.states.contains_key(service)
    }

    /// Decide whether `usage.service` should scale under `policy`.
    pub fn evaluate(&mut self, policy: &AutoScalingPolicy, usage: &ServiceUsage, now: Instant) -> ScaleDecision {
        let Some(state) = self.states.get_mut(&usage.service) else {
            self.track(&usage.service, now);
            return ScaleDecision::NoChange;
        };
        if state.in_flight.is_some() {
            return ScaleDecision::NoChange;
        }
        let interval = Duration::from_secs(policy.trigger.scale_interval_secs);
        if now.saturating_duration_since(state.last_scale) < interval {
            return ScaleDecision::NoChange;
        }

        let trigger = &policy.trigger;
        let direction = if usage.average_load > trigger.upper_load_threshold {
            1
        } else if usage.average_load < trigger.lower_load_threshold {
            -1
        } else {
            return ScaleDecision::NoChange;
        };

        let decision = match policy.mechanism {
            AutoScalingMechanism::AddRemoveIncrementalNamedPartition {
                min_partition_count,
                max_partition_count,
                scale_increment,
            } => {
                let current = i64::from(usage.partition_count);
                let bound = if direction > 0 {
                    bounded_max(max_partition_count, i64::MAX)
                } else {
                    i64::from(min_partition_count)
                };
                let delta = step(current, direction, scale_increment, bound);
                if delta == 0 {
                    ScaleDecision::NoChange
                } else {
                    ScaleDecision::Partitions(delta as i32)
                }
            }
            AutoScalingMechanism::InstanceCount {
                min_instance_count,
                max_instance_count,
                scale_increment,
            } => {
                let current = i64::from(usage.instance_count);
                let bound = if direction > 0 {
                    bounded_max(max_instance_count, i64::from(usage.node_count))
                } else {
                    i64::from(min_instance_count.max(1))
                };
                let delta = step(current, direction, scale_increment, bound);
                if delta == 0 {
                    ScaleDecision::NoChange
                } else {
                    ScaleDecision::Instances((current + delta) as u32)
                }
            }
        };

        match decision {
            ScaleDecision::Partitions(delta) => {
                state.in_flight = Some(delta);
                state.last_scale = now;
                self.pending.insert(usage.service.clone(), delta);
                info!(
                    service = %usage.service,
                    delta,
                    average = usage.average_load,
                    partitions = usage.partition_count,
                    "proposing repartition"
                );
            }
            ScaleDecision::Instances(target) => {
                state.last_scale = now;
                debug!(
                    service = %usage.service,
                    from = usage.instance_count,
                    to = target,
                    average = usage.average_load,
                    "scaling instance count"
                );
            }
            ScaleDecision::NoChange => {}
        }
        decision
    }

    /// Proposed partition delta for a service, if one is queued.
    pub fn partition_count_change(&self, service: &str) -> Option<i32> {
        self.pending.get(service).copied()
    }

    pub fn pending_repartitions(&self) -> &BTreeMap<String, i32> {
        &self.pending
    }

    /// Hand the queued repartitions to the authority.
    pub fn take_pending(&mut self) -> BTreeMap<String, i32> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// The authority applied a new partition count; the in-flight proposal
    /// is complete and the scale interval restarts.
    pub fn on_partition_count_changed(&mut self, service: &str, now: Instant) {
        if let Some(state) = self.states.get_mut(service)
            && state.in_flight.take().is_some()
        {
            state.last_scale = now;
            debug!(%service, "repartition completed");
        }
    }

    /// The authority failed to repartition a service. The failure is kept
    /// until `take_failures` and the service may be proposed again.
    pub fn induce_repartitioning_failure(&mut self, service: &str, reason: &str) {
        let Some(state) = self.states.get_mut(service) else {
            debug!(%service, "repartition failure for untracked service");
            return;
        };
        state.in_flight = None;
        self.pending.remove(service);
        warn!(%service, %reason, "repartitioning failed");
        self.failures.push(AutoScaleError::RepartitionFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn take_failures(&mut self) -> Vec<AutoScaleError> {
        std::mem::take(&mut self.failures)
    }
}

/// `max` as a bound, with `-1` meaning `unbounded`.
fn bounded_max(max: i32, unbounded: i64) -> i64 {
    if max < 0 { unbounded } else { i64::from(max) }
}

/// Signed change of at most `increment` from `current` towards `bound`.
fn step(current: i64, direction: i64, increment: u32, bound: i64) -> i64 {
    let increment = i64::from(increment);
    if direction > 0 {
        increment.min(bound - current).max(0)
    } else {
        -increment.min(current - bound).max(0)
    }
}

#[cfg(test)]
mod tests {
    use plb_core::AutoScalingTrigger;

    use super::*;

    fn partition_policy(lower: f64, upper: f64, interval: u64, min: u32, max: i32, increment: u32) -> AutoScalingPolicy {
        AutoScalingPolicy {
            trigger: AutoScalingTrigger {
                metric_name: "Metric1".into(),
                lower_load_threshold: lower,
                upper_load_threshold: upper,
                scale_interval_secs: interval,
                use_only_primary_load: false,
            },
            mechanism: AutoScalingMechanism::AddRemoveIncrementalNamedPartition {
                min_partition_count: min,
                max_partition_count: max,
                scale_increment: increment,
            },
        }
    }

    fn usage(service: &str, average_load: f64, partitions: u32) -> ServiceUsage {
        ServiceUsage {
            service: service.into(),
            average_load,
            partition_count: partitions,
            instance_count: 1,
            node_count: 5,
        }
    }

    #[test]
    fn partitions_scale_within_bounds() {
        let start = Instant::now();
        let mut advisor = AutoScaleAdvisor::new();
        advisor.track("up", start);
        advisor.track("down", start);
        advisor.track("capped", start);
        let now = start + Duration::from_secs(10);

        let policy = partition_policy(10.0, 20.0, 1, 2, 4, 2);
        assert_eq!(advisor.evaluate(&policy, &usage("up", 40.0, 2), now), ScaleDecision::Partitions(2));
        assert_eq!(advisor.evaluate(&policy, &usage("down", 5.0, 3), now), ScaleDecision::Partitions(-1));
        assert_eq!(advisor.evaluate(&policy, &usage("capped", 40.0, 4), now), ScaleDecision::NoChange);
        assert_eq!(advisor.partition_count_change("up"), Some(2));
        assert_eq!(advisor.partition_count_change("down"), Some(-1));
        assert_eq!(advisor.partition_count_change("capped"), None);
    }

    #[test]
    fn unbounded_maximum() {
        let start = Instant::now();
        let mut advisor = AutoScaleAdvisor::new();
        advisor.track("svc", start);
        let policy = partition_policy(1.0, 2.0, 1, 1, -1, 3);
        let decision = advisor.evaluate(&policy, &usage("svc", 9.0, 100), start + Duration::from_secs(2));
        assert_eq!(decision, ScaleDecision::Partitions(3));
    }

    #[test]
    fn interval_and_in_flight_hold_proposals() {
        let start = Instant::now();
        let mut advisor = AutoScaleAdvisor::new();
        let policy = partition_policy(1.0, 5.0, 100, 2, 5, 1);
        // First sight only starts the clock.
        assert_eq!(advisor.evaluate(&policy, &usage("svc", 9.0, 3), start), ScaleDecision::NoChange);
        assert_eq!(
            advisor.evaluate(&policy, &usage("svc", 9.0, 3), start + Duration::from_secs(50)),
            ScaleDecision::NoChange
        );
        let later = start + Duration::from_secs(120);
        assert_eq!(advisor.evaluate(&policy, &usage("svc", 9.0, 3), later), ScaleDecision::Partitions(1));
        advisor.clear_pending();

        // Not applied yet: nothing new is proposed.
        let much_later = later + Duration::from_secs(500);
        assert_eq!(advisor.evaluate(&policy, &usage("svc", 9.0, 3), much_later), ScaleDecision::NoChange);
        assert!(advisor.pending_repartitions().is_empty());

        advisor.on_partition_count_changed("svc", much_later);
        assert_eq!(
            advisor.evaluate(&policy, &usage("svc", 9.0, 4), much_later + Duration::from_secs(50)),
            ScaleDecision::NoChange
        );
        assert_eq!(
            advisor.evaluate(&policy, &usage("svc", 9.0, 4), much_later + Duration::from_secs(100)),
            ScaleDecision::Partitions(1)
        );
    }

    #[test]
    fn failure_surfaces_once_and_allows_retry() {
        let start = Instant::now();
        let mut advisor = AutoScaleAdvisor::new();
        advisor.track("svc", start);
        let policy = partition_policy(10.0, 20.0, 1, 2, 4, 1);
        let now = start + Duration::from_secs(10);
        assert_eq!(advisor.evaluate(&policy, &usage("svc", 40.0, 3), now), ScaleDecision::Partitions(1));
        advisor.clear_pending();
        assert_eq!(
            advisor.evaluate(&policy, &usage("svc", 40.0, 3), now + Duration::from_secs(20)),
            ScaleDecision::NoChange
        );

        advisor.induce_repartitioning_failure("svc", "Timeout");
        let failures = advisor.take_failures();
        assert_eq!(
            failures,
            vec![AutoScaleError::RepartitionFailed {
                service: "svc".into(),
                reason: "Timeout".into()
            }]
        );
        assert!(advisor.take_failures().is_empty());
        assert_eq!(
            advisor.evaluate(&policy, &usage("svc", 40.0, 3), now + Duration::from_secs(40)),
            ScaleDecision::Partitions(1)
        );
    }

    #[test]
    fn instance_count_scaling() {
        let start = Instant::now();
        let mut advisor = AutoScaleAdvisor::new();
        advisor.track("svc", start);
        let policy = AutoScalingPolicy {
            trigger: AutoScalingTrigger {
                metric_name: "CPU".into(),
                lower_load_threshold: 0.5,
                upper_load_threshold: 0.8,
                scale_interval_secs: 1,
                use_only_primary_load: false,
            },
            mechanism: AutoScalingMechanism::InstanceCount {
                min_instance_count: 1,
                max_instance_count: -1,
                scale_increment: 2,
            },
        };
        let mut u = usage("svc", 0.9, 1);
        u.instance_count = 4;
        let now = start + Duration::from_secs(5);
        // Unbounded maximum is capped by the node count.
        assert_eq!(advisor.evaluate(&policy, &u, now), ScaleDecision::Instances(5));
        u.instance_count = 5;
        u.average_load = 0.1;
        assert_eq!(
            advisor.evaluate(&policy, &u, now + Duration::from_secs(2)),
            ScaleDecision::Instances(3)
        );
        assert!(advisor.pending_repartitions().is_empty());
    }
}
