//! Store contracts consumed by the resolution engine.
//!
//! The engine only ever talks to the durable stores through these traits.
//! `RedbStore` is the persistent implementation; `MemoryStore` is an
//! in-process double used in tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialr_common::{AccountId, Assignment, Branch, ExperimentId, Window};
use std::time::Duration;

use crate::error::StoreResult;
use crate::types::{
    AccessKeyRow, CreatedExperiment, ExperimentBranchRow, ExperimentDraft, NewAssignment,
    PurgeReport,
};

/// Incremental reads of access-key and experiment configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// The store's current time, used as the next sync watermark
    async fn current_time(&self) -> StoreResult<DateTime<Utc>>;

    /// Access keys whose own row or owning account changed in `window`
    async fn access_key_changes(&self, window: Window) -> StoreResult<Vec<AccessKeyRow>>;

    /// Experiment/branch rows whose experiment or owning account changed in
    /// `window`, ordered by experiment key and then branch order
    async fn experiment_changes(&self, window: Window) -> StoreResult<Vec<ExperimentBranchRow>>;
}

/// The durable assignment ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert an assignment, or on conflict with an existing
    /// `(experiment_id, request_id)` row update only its outcome and return
    /// the existing branch and expiry.
    async fn upsert_assignment(&self, new: NewAssignment) -> StoreResult<Assignment>;
}

/// Usage bookkeeping performed after a response is sent
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn record_hit(&self, experiment_id: ExperimentId) -> StoreResult<()>;

    async fn touch_access_key(&self, access_key: &str) -> StoreResult<()>;

    async fn touch_branch(&self, experiment_id: ExperimentId, branch: &str) -> StoreResult<()>;
}

/// Storage-bounding deletes of expired rows
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    /// Delete assignments expired for longer than `grace`, and deactivated
    /// access keys last modified more than `grace` ago
    async fn purge_expired(&self, grace: Duration) -> StoreResult<PurgeReport>;
}

/// Administrative writes. Every write bumps the `modified` time of the row
/// it changes.
pub trait ConfigAdmin: Send + Sync {
    fn create_account(&self) -> StoreResult<AccountId>;

    fn set_account_active(&self, account_id: AccountId, active: bool) -> StoreResult<()>;

    /// Store a caller-chosen access key token
    fn insert_access_key(&self, account_id: AccountId, access_key: &str) -> StoreResult<()>;

    /// Generate and store a new access key token
    fn create_access_key(&self, account_id: AccountId) -> StoreResult<String> {
        let access_key = crate::types::generate_access_key();
        self.insert_access_key(account_id, &access_key)?;
        Ok(access_key)
    }

    fn set_access_key_active(&self, access_key: &str, active: bool) -> StoreResult<()>;

    fn create_experiment(
        &self,
        account_id: AccountId,
        draft: ExperimentDraft,
    ) -> StoreResult<CreatedExperiment>;

    /// Replace an experiment's branches in one transaction
    fn replace_branches(&self, experiment_id: ExperimentId, branches: Vec<Branch>)
    -> StoreResult<()>;

    fn set_experiment_running(&self, experiment_id: ExperimentId, running: bool)
    -> StoreResult<()>;

    fn set_experiment_active(&self, experiment_id: ExperimentId, active: bool) -> StoreResult<()>;

    fn set_request_ttl(&self, experiment_id: ExperimentId, request_ttl_secs: u32)
    -> StoreResult<()>;

    fn experiment_hits(&self, experiment_id: ExperimentId) -> StoreResult<u64>;

    fn access_key_last_used(&self, access_key: &str) -> StoreResult<Option<DateTime<Utc>>>;

    fn branch_last_used(
        &self,
        experiment_id: ExperimentId,
        branch: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;
}
