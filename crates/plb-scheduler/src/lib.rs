//! plb-scheduler: the placement and load-balancing engine.
//!
//! `PlacementAndLoadBalancer` is the single entry point the failover
//! authority talks to. It:
//!
//! - Ingests node, service, application, failover unit and load updates
//!   into the cluster model
//! - Picks one scheduler action per service domain on every refresh
//! - Runs the placement and balancing searches on domain snapshots
//! - Emits movements to the authority and reports every dropped one
//! - Serves client-triggered actions and load queries
//!
//! # Architecture
//!
//! ```text
//! PlacementAndLoadBalancer
//!   ├── PlbConfig (RwLock)
//!   ├── ClusterModel (RwLock, plb-model)
//!   ├── SchedulerState (Mutex)
//!   │   ├── DomainTiming per domain (action selector memory)
//!   │   ├── MovementEmitter (pending movements, drop ledger, throttle)
//!   │   ├── AutoScaleAdvisor (plb-autoscale)
//!   │   └── upgrade safety checks, unplaced replica reports
//!   ├── StatisticsAggregator (+ optional StatsStore, plb-metrics)
//!   └── FailoverAuthority (outbound movements and notifications)
//! ```
//!
//! A refresh is `begin_refresh` (snapshot + action selection under the
//! locks), `RefreshPass::run` (searches, no lock held) and `end_refresh`
//! (staleness check, verification, emission).

pub mod action;
pub mod authority;
pub mod client_api;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod query;

pub use action::{DomainTiming, SelectorContext, select_action};
pub use authority::{FailoverAuthority, RecordingAuthority};
pub use emitter::{EmitOutcome, MovementEmitter, PendingMovement, drop_reason};
pub use engine::{DomainPass, PlacementAndLoadBalancer, RefreshPass, RefreshReport, SafetyCheckState};
pub use error::{SchedulerError, SchedulerResult};
pub use query::{
    ApplicationLoadInformation, ApplicationMetricInformation, ClusterLoadInformation, MetricLoadInformation,
    NodeLoadInformation, NodeMetricInformation, describe_unplaced,
};
