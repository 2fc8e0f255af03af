//! Error types for the auto-scale advisor.

use thiserror::Error;

pub type AutoScaleResult<T> = Result<T, AutoScaleError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutoScaleError {
    #[error("invalid cpuset {0:?}")]
    InvalidCpuset(String),

    #[error("repartitioning of {service} failed: {reason}")]
    RepartitionFailed { service: String, reason: String },
}
