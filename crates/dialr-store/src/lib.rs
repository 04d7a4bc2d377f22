//! Dialr Store - durable configuration and assignment ledger
//!
//! This crate defines the store contracts the resolution engine depends on,
//! a persistent redb-backed implementation, and an in-memory implementation.

mod clock;
pub mod error;
pub mod memory;
mod scan;
pub mod store;
mod tables;
pub mod traits;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use store::RedbStore;
pub use traits::{ConfigAdmin, ConfigStore, LedgerStore, MaintenanceStore, UsageStore};
pub use types::{
    AccessKeyRow, CreatedExperiment, ExperimentBranchRow, ExperimentDraft, NewAssignment,
    PurgeReport,
};
