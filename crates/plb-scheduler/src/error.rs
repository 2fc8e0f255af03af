//! Scheduler error types.

use thiserror::Error;

use plb_core::{FailoverUnitId, NodeId, PlbMovementIgnoredReason};
use plb_placement::{ExpressionError, Violation};

/// Errors returned by the engine's update, query and client API calls.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("model update rejected: {0}")]
    Model(#[from] plb_model::ModelError),

    #[error("invalid placement constraint {expression:?}: {source}")]
    InvalidPlacementConstraint {
        expression: String,
        #[source]
        source: ExpressionError,
    },

    #[error("invalid auto-scaling policy for service {service}: {reason}")]
    InvalidScalingPolicy { service: String, reason: String },

    #[error("failover unit not found: {0}")]
    FailoverUnitNotFound(FailoverUnitId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("failover unit {failover_unit} has no {role} replica on node {node}")]
    ReplicaNotFound {
        failover_unit: FailoverUnitId,
        node: NodeId,
        role: &'static str,
    },

    #[error("service {0} is stateless and has no primary")]
    NotStateful(String),

    #[error("constraint not satisfied: {0}")]
    ConstraintNotSatisfied(Violation),

    #[error("movement not emitted: {0}")]
    MovementDropped(PlbMovementIgnoredReason),

    #[error("auto-scaling error: {0}")]
    AutoScale(#[from] plb_autoscale::AutoScaleError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("statistics store error: {0}")]
    Stats(#[from] plb_metrics::StatsError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
