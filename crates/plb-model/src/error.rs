//! Error types for the cluster model store.

use thiserror::Error;

use plb_core::FailoverUnitId;

/// Result type alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Reasons an update is rejected. The model is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("application {0} still has services")]
    ApplicationInUse(String),

    #[error("service package {package} is not declared by application {application}")]
    ServicePackageNotFound { application: String, package: String },

    #[error("failover unit not found: {0}")]
    FailoverUnitNotFound(FailoverUnitId),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("stale version for failover unit {id}: stored {stored}, received {received}")]
    StaleVersion {
        id: FailoverUnitId,
        stored: u64,
        received: u64,
    },

    #[error("negative capacity {value} for metric {metric} on node {node}")]
    NegativeCapacity {
        node: String,
        metric: String,
        value: i64,
    },

    #[error("affinity chain through {0} is not supported")]
    AffinityChainNotSupported(String),

    #[error("insufficient cluster capacity for metric {metric}: required {required}, available {available}")]
    InsufficientClusterCapacity {
        metric: String,
        required: i64,
        available: i64,
    },

    #[error("invalid description: {0}")]
    InvalidDescription(String),
}
