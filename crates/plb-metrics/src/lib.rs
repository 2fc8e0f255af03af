//! plb-metrics: statistics of the placement and load-balancing engine.
//!
//! Counts movements and drops, keeps gauges of the cluster the engine
//! schedules (resource governance usage, defragmentation metrics,
//! auto-scaled services), renders them for Prometheus and persists a
//! history of snapshots. None of it is consulted by the optimizer.
//!
//! # Architecture
//!
//! ```text
//! StatisticsAggregator
//!   ├── record_movements() / record_drop() ← called by the emitter
//!   ├── set_gauges()                       ← refreshed by the engine
//!   └── snapshot() → PlbStatistics
//!
//! StatsStore (redb)
//!   └── put() / latest() / history() / prune()
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod aggregator;
pub mod error;
pub mod prometheus;
pub mod store;

pub use aggregator::{ClusterGauges, PlbStatistics, StatisticsAggregator};
pub use error::{StatsError, StatsResult};
pub use prometheus::render_prometheus;
pub use store::StatsStore;
