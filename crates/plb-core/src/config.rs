//! plb.toml configuration parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MoveCost;

/// Tuning knobs of the placement and load-balancing engine.
///
/// Every field has a default, so an empty file is a valid configuration.
/// Durations are written as strings: `"500ms"`, `"1s"`, `"5m"`, `"1h"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlbConfig {
    // Timing.
    #[serde(with = "duration_str")]
    pub refresh_interval: Duration,
    #[serde(with = "duration_str")]
    pub min_placement_interval: Duration,
    #[serde(with = "duration_str")]
    pub min_constraint_check_interval: Duration,
    #[serde(with = "duration_str")]
    pub min_load_balancing_interval: Duration,
    /// Age after which an unacknowledged movement may be superseded.
    #[serde(with = "duration_str")]
    pub max_movement_execution_time: Duration,
    #[serde(with = "duration_str")]
    pub fm_busy_backoff: Duration,
    #[serde(with = "duration_str")]
    pub statistics_interval: Duration,
    #[serde(with = "duration_str")]
    pub balancing_delay_after_node_down: Duration,
    #[serde(with = "duration_str")]
    pub balancing_delay_after_new_node: Duration,
    #[serde(with = "duration_str")]
    pub global_movement_throttle_counting_interval: Duration,

    // Governance.
    pub govern_only_main_memory_for_processes: bool,
    pub local_resource_manager_test_mode: bool,

    // Feature toggles.
    pub placement_enabled: bool,
    pub constraint_check_enabled: bool,
    pub balancing_enabled: bool,
    pub fault_domain_enabled: bool,
    pub upgrade_domain_enabled: bool,
    pub move_existing_replica_for_placement: bool,
    pub place_child_without_parent: bool,
    pub prefer_upgraded_upgrade_domains: bool,
    pub allow_balancing_during_application_upgrade: bool,
    pub interrupt_balancing_for_load_updates: bool,
    pub parallel_domains: bool,
    pub drop_all_movements: bool,

    // Search.
    pub placement_search_budget: u32,
    pub constraint_check_search_budget: u32,
    pub quick_balancing_search_budget: u32,
    pub balancing_search_budget: u32,
    pub quick_balancing_node_limit: usize,
    pub max_percentage_to_move: f64,
    /// Balancing moves allowed per counting interval; 0 disables the throttle.
    pub global_movement_throttle_threshold: u32,
    pub score_improvement_threshold: f64,
    pub maximum_in_build_replicas_per_node: Option<u32>,

    // Cost.
    pub move_cost_weight: f64,
    pub swap_cost: f64,
    pub move_cost_zero_value: u32,
    pub move_cost_low_value: u32,
    pub move_cost_medium_value: u32,
    pub move_cost_high_value: u32,

    pub consecutive_dropped_movements_warning_limit: u32,

    // Per-metric knobs. TOML tables must follow plain values.
    pub metric_activity_thresholds: BTreeMap<String, i64>,
    pub metric_balancing_thresholds: BTreeMap<String, f64>,
    pub global_metric_weights: BTreeMap<String, f64>,
    pub defragmentation_metrics: BTreeMap<String, bool>,
    /// Number of empty nodes a defragmentation metric aims for.
    pub defragmentation_empty_node_threshold: BTreeMap<String, u32>,
    /// Fraction of node capacity kept free during placement and balancing.
    pub node_buffer_percentage: BTreeMap<String, f64>,
}

impl Default for PlbConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(1),
            min_placement_interval: Duration::from_secs(1),
            min_constraint_check_interval: Duration::from_secs(1),
            min_load_balancing_interval: Duration::from_secs(5),
            max_movement_execution_time: Duration::from_secs(20),
            fm_busy_backoff: Duration::from_secs(5),
            statistics_interval: Duration::from_secs(60),
            balancing_delay_after_node_down: Duration::from_secs(120),
            balancing_delay_after_new_node: Duration::from_secs(120),
            global_movement_throttle_counting_interval: Duration::from_secs(600),
            metric_activity_thresholds: BTreeMap::new(),
            metric_balancing_thresholds: BTreeMap::new(),
            global_metric_weights: BTreeMap::new(),
            defragmentation_metrics: BTreeMap::new(),
            defragmentation_empty_node_threshold: BTreeMap::new(),
            node_buffer_percentage: BTreeMap::new(),
            govern_only_main_memory_for_processes: false,
            local_resource_manager_test_mode: false,
            placement_enabled: true,
            constraint_check_enabled: true,
            balancing_enabled: true,
            fault_domain_enabled: true,
            upgrade_domain_enabled: true,
            move_existing_replica_for_placement: true,
            place_child_without_parent: true,
            prefer_upgraded_upgrade_domains: true,
            allow_balancing_during_application_upgrade: true,
            interrupt_balancing_for_load_updates: false,
            parallel_domains: true,
            drop_all_movements: false,
            placement_search_budget: 10_000,
            constraint_check_search_budget: 5_000,
            quick_balancing_search_budget: 2_000,
            balancing_search_budget: 20_000,
            quick_balancing_node_limit: 2,
            max_percentage_to_move: 0.3,
            global_movement_throttle_threshold: 1000,
            score_improvement_threshold: 1e-9,
            maximum_in_build_replicas_per_node: None,
            move_cost_weight: 0.001,
            swap_cost: 0.1,
            move_cost_zero_value: 0,
            move_cost_low_value: 1,
            move_cost_medium_value: 15,
            move_cost_high_value: 40,
            consecutive_dropped_movements_warning_limit: 20,
        }
    }
}

impl PlbConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PlbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.max_percentage_to_move) {
            anyhow::bail!(
                "max_percentage_to_move must be within 0..=1, got {}",
                self.max_percentage_to_move
            );
        }
        for (metric, pct) in &self.node_buffer_percentage {
            if !(0.0..1.0).contains(pct) {
                anyhow::bail!("node_buffer_percentage for {metric} must be within 0..1, got {pct}");
            }
        }
        for (metric, threshold) in &self.metric_balancing_thresholds {
            if *threshold < 1.0 {
                anyhow::bail!("metric_balancing_thresholds for {metric} must be >= 1, got {threshold}");
            }
        }
        if self.refresh_interval.is_zero() {
            anyhow::bail!("refresh_interval must be positive");
        }
        Ok(())
    }

    pub fn activity_threshold(&self, metric: &str) -> i64 {
        self.metric_activity_thresholds.get(metric).copied().unwrap_or(0)
    }

    /// Max/min node load ratio tolerated before a metric counts as imbalanced.
    pub fn balancing_threshold(&self, metric: &str) -> f64 {
        self.metric_balancing_thresholds.get(metric).copied().unwrap_or(1.0)
    }

    pub fn global_weight(&self, metric: &str) -> f64 {
        self.global_metric_weights.get(metric).copied().unwrap_or(1.0)
    }

    pub fn is_defragmentation_metric(&self, metric: &str) -> bool {
        self.defragmentation_metrics.get(metric).copied().unwrap_or(false)
    }

    pub fn empty_node_threshold(&self, metric: &str) -> u32 {
        self.defragmentation_empty_node_threshold
            .get(metric)
            .copied()
            .unwrap_or(1)
    }

    pub fn node_buffer(&self, metric: &str) -> f64 {
        self.node_buffer_percentage.get(metric).copied().unwrap_or(0.0)
    }

    pub fn move_cost_value(&self, cost: MoveCost) -> u32 {
        match cost {
            MoveCost::Zero => self.move_cost_zero_value,
            MoveCost::Low => self.move_cost_low_value,
            MoveCost::Medium => self.move_cost_medium_value,
            MoveCost::High => self.move_cost_high_value,
        }
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<f64>().ok().filter(|v| *v >= 0.0).map(Duration::from_secs_f64)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid duration: {raw:?}")))
    }
}
