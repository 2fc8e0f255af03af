//! plb-autoscale: auto-scaling proposals and resource governance limits.
//!
//! The advisor never changes the cluster itself. It compares the average
//! load of auto-scaled services against their trigger thresholds and queues
//! proposals that the failover authority consumes; governance limits are
//! computed for an enforcement layer that lives outside the engine.
//!
//! # Scaling Algorithm
//!
//! ```text
//! average = mean load of the trigger metric per partition (or instance)
//!
//! if now - last_scale < scale_interval:       wait
//! if a repartition is still in flight:        wait
//!
//! if average > upper_load_threshold:
//!     grow by scale_increment, capped at the maximum (-1 = unbounded)
//!
//! if average < lower_load_threshold:
//!     shrink by scale_increment, floored at the minimum
//! ```
//!
//! A partition-count proposal stays in flight until the authority reports
//! the new partition count or a failure. A reported failure surfaces once
//! through `take_failures()` and the service becomes eligible again.

pub mod advisor;
pub mod error;
pub mod governance;

pub use advisor::{AutoScaleAdvisor, ScaleDecision, ServiceUsage};
pub use error::{AutoScaleError, AutoScaleResult};
pub use governance::{CodePackageLimits, MemoryScope, PackageLimits, governance_grows, package_limits, parse_cpuset};
