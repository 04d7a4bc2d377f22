//! In-memory store.
//!
//! Implements every store contract over plain maps behind one mutex. Used as
//! the durable-store double in tests (with fault injection and a movable
//! clock) and for running the gateway without a database file.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dialr_common::{AccountId, Assignment, Branch, ExperimentId, Window};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::clock::StoreClock;
use crate::error::{StoreError, StoreResult};
use crate::scan;
use crate::traits::{ConfigAdmin, ConfigStore, LedgerStore, MaintenanceStore, UsageStore};
use crate::types::{
    AccessKeyRow, CreatedExperiment, ExperimentBranchRow, ExperimentDraft, NewAssignment,
    PurgeReport, StoredAccessKey, StoredAccount, StoredAssignment, StoredExperiment,
    stored_branches, validate_branches,
};

struct MemoryState {
    clock: StoreClock,
    skew: TimeDelta,
    next_account_id: AccountId,
    next_experiment_id: ExperimentId,
    accounts: HashMap<AccountId, StoredAccount>,
    access_keys: HashMap<String, StoredAccessKey>,
    experiments: HashMap<ExperimentId, StoredExperiment>,
    assignments: HashMap<(ExperimentId, String), StoredAssignment>,
}

impl MemoryState {
    fn stamp(&mut self) -> DateTime<Utc> {
        let wall = Utc::now() + self.skew;
        self.clock.tick(wall)
    }

    fn experiment_mut(&mut self, experiment_id: ExperimentId) -> StoreResult<&mut StoredExperiment> {
        self.experiments
            .get_mut(&experiment_id)
            .ok_or(StoreError::ExperimentNotFound(experiment_id))
    }

    fn update_experiment(
        &mut self,
        experiment_id: ExperimentId,
        f: impl FnOnce(&mut StoredExperiment),
    ) -> StoreResult<()> {
        let modified = self.stamp();
        let exp = self.experiment_mut(experiment_id)?;
        f(exp);
        exp.modified = modified;
        Ok(())
    }
}

#[derive(Default)]
struct Faults {
    fail_config: AtomicBool,
    fail_ledger: AtomicBool,
    fail_usage: AtomicBool,
    ledger_delay_ms: AtomicU64,
    ledger_calls: AtomicU64,
    config_calls: AtomicU64,
}

/// In-memory implementation of all store contracts
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Faults,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                clock: StoreClock::new(DateTime::<Utc>::UNIX_EPOCH),
                skew: TimeDelta::zero(),
                next_account_id: 1,
                next_experiment_id: 1,
                accounts: HashMap::new(),
                access_keys: HashMap::new(),
                experiments: HashMap::new(),
                assignments: HashMap::new(),
            }),
            faults: Faults::default(),
        }
    }

    // =========== Fault injection ===========

    /// Make config queries (including `current_time`) fail
    pub fn fail_config_queries(&self, fail: bool) {
        self.faults.fail_config.store(fail, Ordering::SeqCst);
    }

    /// Make ledger upserts fail
    pub fn fail_ledger(&self, fail: bool) {
        self.faults.fail_ledger.store(fail, Ordering::SeqCst);
    }

    /// Make usage bookkeeping fail
    pub fn fail_usage(&self, fail: bool) {
        self.faults.fail_usage.store(fail, Ordering::SeqCst);
    }

    /// Delay every ledger upsert before it takes the store lock
    pub fn ledger_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.ledger_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Move the store clock forward
    pub fn advance_clock(&self, by: Duration) {
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        self.state.lock().skew += by;
    }

    /// Number of ledger upserts attempted
    pub fn ledger_calls(&self) -> u64 {
        self.faults.ledger_calls.load(Ordering::SeqCst)
    }

    /// Number of change queries attempted
    pub fn config_calls(&self) -> u64 {
        self.faults.config_calls.load(Ordering::SeqCst)
    }

    /// Number of ledger rows currently stored
    pub fn assignment_count(&self) -> usize {
        self.state.lock().assignments.len()
    }

    /// Outcome annotation recorded for an assignment
    pub fn assignment_outcome(&self, experiment_id: ExperimentId, request_id: &str) -> Option<String> {
        self.state
            .lock()
            .assignments
            .get(&(experiment_id, request_id.to_string()))
            .and_then(|a| a.outcome.clone())
    }

    fn check_config(&self) -> StoreResult<()> {
        self.faults.config_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_config.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("config queries disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        self.check_config()?;
        Ok(self.state.lock().stamp())
    }

    async fn access_key_changes(&self, window: Window) -> StoreResult<Vec<AccessKeyRow>> {
        self.check_config()?;
        let state = self.state.lock();
        Ok(scan::access_key_rows(
            &state.accounts,
            state.access_keys.values(),
            window,
        ))
    }

    async fn experiment_changes(&self, window: Window) -> StoreResult<Vec<ExperimentBranchRow>> {
        self.check_config()?;
        let state = self.state.lock();
        Ok(scan::experiment_rows(
            &state.accounts,
            state.experiments.values(),
            window,
        ))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn upsert_assignment(&self, new: NewAssignment) -> StoreResult<Assignment> {
        self.faults.ledger_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.ledger_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.faults.fail_ledger.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("ledger disabled".into()));
        }

        let mut state = self.state.lock();
        let now = state.stamp();
        let row = match state.assignments.entry((new.experiment_id, new.request_id)) {
            Entry::Occupied(mut e) => {
                e.get_mut().outcome = new.outcome;
                e.get().clone()
            }
            Entry::Vacant(e) => e
                .insert(StoredAssignment {
                    branch: new.branch,
                    expiry: now + TimeDelta::seconds(i64::from(new.ttl_secs)),
                    outcome: new.outcome,
                })
                .clone(),
        };
        Ok(Assignment {
            experiment_id: new.experiment_id,
            branch: row.branch,
            expiry: row.expiry,
        })
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn record_hit(&self, experiment_id: ExperimentId) -> StoreResult<()> {
        if self.faults.fail_usage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage disabled".into()));
        }
        let mut state = self.state.lock();
        state.experiment_mut(experiment_id)?.hits += 1;
        Ok(())
    }

    async fn touch_access_key(&self, access_key: &str) -> StoreResult<()> {
        if self.faults.fail_usage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage disabled".into()));
        }
        let mut state = self.state.lock();
        let now = state.stamp();
        let key = state
            .access_keys
            .get_mut(access_key)
            .ok_or_else(|| StoreError::AccessKeyNotFound(access_key.to_string()))?;
        key.last_used = Some(now);
        Ok(())
    }

    async fn touch_branch(&self, experiment_id: ExperimentId, branch: &str) -> StoreResult<()> {
        if self.faults.fail_usage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage disabled".into()));
        }
        let mut state = self.state.lock();
        let now = state.stamp();
        let exp = state.experiment_mut(experiment_id)?;
        if let Some(b) = exp.branches.iter_mut().find(|b| b.branch.value == branch) {
            b.last_used = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl MaintenanceStore for MemoryStore {
    async fn purge_expired(&self, grace: Duration) -> StoreResult<PurgeReport> {
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        let mut state = self.state.lock();
        let now = state.stamp();
        let cutoff = now
            .checked_sub_signed(grace)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let before = state.assignments.len();
        state.assignments.retain(|_, a| a.expiry >= cutoff);
        let assignments = before - state.assignments.len();

        let before = state.access_keys.len();
        state
            .access_keys
            .retain(|_, k| k.active || k.modified >= cutoff);
        let access_keys = before - state.access_keys.len();

        Ok(PurgeReport {
            assignments,
            access_keys,
        })
    }
}

impl ConfigAdmin for MemoryStore {
    fn create_account(&self) -> StoreResult<AccountId> {
        let mut state = self.state.lock();
        let modified = state.stamp();
        let account_id = state.next_account_id;
        state.next_account_id += 1;
        state.accounts.insert(
            account_id,
            StoredAccount {
                account_id,
                active: true,
                modified,
            },
        );
        Ok(account_id)
    }

    fn set_account_active(&self, account_id: AccountId, active: bool) -> StoreResult<()> {
        let mut state = self.state.lock();
        let modified = state.stamp();
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::AccountNotFound(account_id))?;
        account.active = active;
        account.modified = modified;
        Ok(())
    }

    fn insert_access_key(&self, account_id: AccountId, access_key: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        match state.accounts.get(&account_id) {
            None => return Err(StoreError::AccountNotFound(account_id)),
            Some(a) if !a.active => return Err(StoreError::AccountInactive(account_id)),
            Some(_) => {}
        }
        if state.access_keys.contains_key(access_key) {
            return Err(StoreError::DuplicateAccessKey);
        }
        let modified = state.stamp();
        state.access_keys.insert(
            access_key.to_string(),
            StoredAccessKey {
                access_key: access_key.to_string(),
                account_id,
                active: true,
                modified,
                last_used: None,
            },
        );
        Ok(())
    }

    fn set_access_key_active(&self, access_key: &str, active: bool) -> StoreResult<()> {
        let mut state = self.state.lock();
        let modified = state.stamp();
        let key = state
            .access_keys
            .get_mut(access_key)
            .ok_or_else(|| StoreError::AccessKeyNotFound(access_key.to_string()))?;
        key.active = active;
        key.modified = modified;
        Ok(())
    }

    fn create_experiment(
        &self,
        account_id: AccountId,
        draft: ExperimentDraft,
    ) -> StoreResult<CreatedExperiment> {
        validate_branches(&draft.branches)?;
        let mut state = self.state.lock();
        if !state.accounts.contains_key(&account_id) {
            return Err(StoreError::AccountNotFound(account_id));
        }
        let experiment_key = draft
            .experiment_key
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if state
            .experiments
            .values()
            .any(|e| e.account_id == account_id && e.experiment_key == experiment_key)
        {
            return Err(StoreError::DuplicateExperimentKey(experiment_key));
        }

        let modified = state.stamp();
        let experiment_id = state.next_experiment_id;
        state.next_experiment_id += 1;
        state.experiments.insert(
            experiment_id,
            StoredExperiment {
                experiment_id,
                account_id,
                experiment_key: experiment_key.clone(),
                request_ttl_secs: draft.request_ttl_secs,
                running: draft.running,
                active: true,
                hits: 0,
                modified,
                branches: stored_branches(draft.branches),
            },
        );
        Ok(CreatedExperiment {
            experiment_id,
            experiment_key,
        })
    }

    fn replace_branches(
        &self,
        experiment_id: ExperimentId,
        branches: Vec<Branch>,
    ) -> StoreResult<()> {
        validate_branches(&branches)?;
        self.state
            .lock()
            .update_experiment(experiment_id, |e| e.branches = stored_branches(branches))
    }

    fn set_experiment_running(
        &self,
        experiment_id: ExperimentId,
        running: bool,
    ) -> StoreResult<()> {
        self.state
            .lock()
            .update_experiment(experiment_id, |e| e.running = running)
    }

    fn set_experiment_active(&self, experiment_id: ExperimentId, active: bool) -> StoreResult<()> {
        self.state
            .lock()
            .update_experiment(experiment_id, |e| e.active = active)
    }

    fn set_request_ttl(
        &self,
        experiment_id: ExperimentId,
        request_ttl_secs: u32,
    ) -> StoreResult<()> {
        self.state
            .lock()
            .update_experiment(experiment_id, |e| e.request_ttl_secs = request_ttl_secs)
    }

    fn experiment_hits(&self, experiment_id: ExperimentId) -> StoreResult<u64> {
        self.state
            .lock()
            .experiments
            .get(&experiment_id)
            .map(|e| e.hits)
            .ok_or(StoreError::ExperimentNotFound(experiment_id))
    }

    fn access_key_last_used(&self, access_key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.state
            .lock()
            .access_keys
            .get(access_key)
            .map(|k| k.last_used)
            .ok_or_else(|| StoreError::AccessKeyNotFound(access_key.to_string()))
    }

    fn branch_last_used(
        &self,
        experiment_id: ExperimentId,
        branch: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state.lock();
        let exp = state
            .experiments
            .get(&experiment_id)
            .ok_or(StoreError::ExperimentNotFound(experiment_id))?;
        Ok(exp
            .branches
            .iter()
            .find(|b| b.branch.value == branch)
            .and_then(|b| b.last_used))
    }
}
