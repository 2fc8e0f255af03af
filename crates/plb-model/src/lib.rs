//! plb-model: the cluster model store of the PLB.
//!
//! Holds every node, service type, application, service, failover unit and
//! load report the failover authority pushes in, and partitions services
//! into independently scheduled service domains.
//!
//! # Architecture
//!
//! Entities live in arena tables keyed by opaque integer ids (`ServiceId`,
//! `ApplicationId`, `ServicePackageId`, `DomainId`); relationships are id
//! lookups. Each domain carries a generation counter that every mutation
//! touching it bumps, so a scheduling pass computed on a `DomainSnapshot`
//! can tell whether its inputs went stale.
//!
//! `ClusterModel` is not synchronized. The scheduler wraps it in a
//! reader/writer lock and only ever hands snapshots to the optimizer.

pub mod domain;
pub mod error;
pub mod model;
pub mod snapshot;

pub use domain::{ApplicationId, DomainId, ReservationLedger, ServiceDomain, ServiceId, ServicePackageId};
pub use error::{ModelError, ModelResult};
pub use model::{
    ApplicationEntry, ApplicationUpdate, ClusterModel, FailoverUnitEntry, FailoverUnitUpdate,
    NodeChange, ServiceEntry, ServicePackageEntry,
};
pub use snapshot::*;
