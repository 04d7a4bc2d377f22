//! Dialr Engine - branch resolution and replicated state
//!
//! This crate provides:
//! - `StateCache`: in-memory mirror of access keys and experiment configs
//! - `SyncJob`: watermark-based incremental refresh of the state cache
//! - `BranchResolver`: weighted selection backed by an idempotent ledger
//! - `SingleFlight` and the periodic job harness
//! - `Engine`: wiring for all of the above

pub mod assignments;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod resolver;
pub mod single_flight;
pub mod state;
pub mod sync;

pub use assignments::{AssignmentCache, AssignmentKey};
pub use engine::{Backend, Engine};
pub use error::{ResolveError, SyncError};
pub use jobs::{Job, MaintenanceJob, Scheduled, spawn_periodic};
pub use resolver::{
    BranchFilter, BranchResolver, Draw, RequestContext, Resolution, ResolveRequest, ThreadRngDraw,
    select_branch,
};
pub use single_flight::{FlightGuard, SingleFlight};
pub use state::StateCache;
pub use sync::{SyncJob, SyncReport};
