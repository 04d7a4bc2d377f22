//! Persistent store backed by redb.
//!
//! All writes run in a single write transaction while holding the store
//! clock, so modification stamps are issued in commit order. Async contract
//! methods move the blocking redb work onto `spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dialr_common::{AccountId, Assignment, Branch, ExperimentId, Window};
use parking_lot::Mutex;
use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::clock::StoreClock;
use crate::error::{StoreError, StoreResult};
use crate::scan;
use crate::tables;
use crate::traits::{ConfigAdmin, ConfigStore, LedgerStore, MaintenanceStore, UsageStore};
use crate::types::{
    AccessKeyRow, CreatedExperiment, ExperimentBranchRow, ExperimentDraft, NewAssignment,
    PurgeReport, StoredAccessKey, StoredAccount, StoredAssignment, StoredExperiment,
    stored_branches, validate_branches,
};

struct Inner {
    db: Database,
    clock: Mutex<StoreClock>,
}

/// Persistent store backed by redb
#[derive(Clone)]
pub struct RedbStore {
    inner: Arc<Inner>,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ACCOUNTS)?;
            let _t = write_txn.open_table(tables::ACCESS_KEYS)?;
            let _t = write_txn.open_table(tables::EXPERIMENTS)?;
            let _t = write_txn.open_table(tables::ASSIGNMENTS)?;
            let _t = write_txn.open_table(tables::SEQUENCES)?;
        }
        write_txn.commit()?;

        // Resume the clock after the newest stamp on disk
        let newest = {
            let read_txn = db.begin_read()?;
            let accounts = read_accounts(&read_txn)?;
            let keys = read_access_keys(&read_txn)?;
            let experiments = read_experiments(&read_txn)?;
            accounts
                .values()
                .map(|a| a.modified)
                .chain(keys.iter().map(|k| k.modified))
                .chain(experiments.iter().map(|e| e.modified))
                .max()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        };
        debug!("Opened store at {} (newest stamp {})", path.display(), newest);

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                clock: Mutex::new(StoreClock::new(newest)),
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> StoreResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    /// Run `f` in a write transaction stamped with a fresh clock tick. The
    /// clock stays locked until the commit completes.
    fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction, DateTime<Utc>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut clock = self.clock.lock();
        let now = clock.tick(Utc::now());
        let write_txn = self.db.begin_write()?;
        let result = f(&write_txn, now)?;
        write_txn.commit()?;
        Ok(result)
    }

    fn current_time(&self) -> DateTime<Utc> {
        self.clock.lock().tick(Utc::now())
    }

    fn update_account(
        &self,
        account_id: AccountId,
        f: impl FnOnce(&mut StoredAccount),
    ) -> StoreResult<()> {
        self.write(|txn, now| {
            let mut table = txn.open_table(tables::ACCOUNTS)?;
            let mut account: StoredAccount = match table.get(account_id)? {
                Some(v) => bincode::deserialize(v.value())?,
                None => return Err(StoreError::AccountNotFound(account_id)),
            };
            f(&mut account);
            account.modified = now;
            table.insert(account_id, bincode::serialize(&account)?.as_slice())?;
            Ok(())
        })
    }

    fn update_access_key(
        &self,
        access_key: &str,
        bump_modified: bool,
        f: impl FnOnce(&mut StoredAccessKey, DateTime<Utc>),
    ) -> StoreResult<()> {
        self.write(|txn, now| {
            let mut table = txn.open_table(tables::ACCESS_KEYS)?;
            let mut key: StoredAccessKey = match table.get(access_key)? {
                Some(v) => bincode::deserialize(v.value())?,
                None => return Err(StoreError::AccessKeyNotFound(access_key.to_string())),
            };
            f(&mut key, now);
            if bump_modified {
                key.modified = now;
            }
            table.insert(access_key, bincode::serialize(&key)?.as_slice())?;
            Ok(())
        })
    }

    fn update_experiment(
        &self,
        experiment_id: ExperimentId,
        bump_modified: bool,
        f: impl FnOnce(&mut StoredExperiment, DateTime<Utc>),
    ) -> StoreResult<()> {
        self.write(|txn, now| {
            let mut table = txn.open_table(tables::EXPERIMENTS)?;
            let mut exp: StoredExperiment = match table.get(experiment_id)? {
                Some(v) => bincode::deserialize(v.value())?,
                None => return Err(StoreError::ExperimentNotFound(experiment_id)),
            };
            f(&mut exp, now);
            if bump_modified {
                exp.modified = now;
            }
            table.insert(experiment_id, bincode::serialize(&exp)?.as_slice())?;
            Ok(())
        })
    }

    fn get_experiment(&self, experiment_id: ExperimentId) -> StoreResult<StoredExperiment> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::EXPERIMENTS)?;
        match table.get(experiment_id)? {
            Some(v) => Ok(bincode::deserialize(v.value())?),
            None => Err(StoreError::ExperimentNotFound(experiment_id)),
        }
    }

    fn get_access_key(&self, access_key: &str) -> StoreResult<StoredAccessKey> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ACCESS_KEYS)?;
        match table.get(access_key)? {
            Some(v) => Ok(bincode::deserialize(v.value())?),
            None => Err(StoreError::AccessKeyNotFound(access_key.to_string())),
        }
    }

    fn upsert_assignment(&self, new: NewAssignment) -> StoreResult<Assignment> {
        self.write(|txn, now| {
            let mut table = txn.open_table(tables::ASSIGNMENTS)?;
            let key = (new.experiment_id, new.request_id.as_str());
            let existing: Option<StoredAssignment> = match table.get(key)? {
                Some(v) => Some(bincode::deserialize(v.value())?),
                None => None,
            };
            let row = match existing {
                Some(mut row) => {
                    row.outcome = new.outcome;
                    row
                }
                None => StoredAssignment {
                    branch: new.branch,
                    expiry: now + TimeDelta::seconds(i64::from(new.ttl_secs)),
                    outcome: new.outcome,
                },
            };
            table.insert(key, bincode::serialize(&row)?.as_slice())?;
            Ok(Assignment {
                experiment_id: new.experiment_id,
                branch: row.branch,
                expiry: row.expiry,
            })
        })
    }

    fn purge_expired(&self, grace: TimeDelta) -> StoreResult<PurgeReport> {
        self.write(|txn, now| {
            let cutoff = now
                .checked_sub_signed(grace)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);

            let mut assignments = txn.open_table(tables::ASSIGNMENTS)?;
            let mut expired: Vec<(u64, String)> = Vec::new();
            for entry in assignments.iter()? {
                let (k, v) = entry?;
                let (experiment_id, request_id) = k.value();
                match bincode::deserialize::<StoredAssignment>(v.value()) {
                    Ok(a) if a.expiry < cutoff => {
                        expired.push((experiment_id, request_id.to_string()));
                    }
                    Ok(_) => {}
                    Err(e) => error!(
                        "Failed to decode assignment '{}/{}': {}",
                        experiment_id, request_id, e
                    ),
                }
            }
            for (experiment_id, request_id) in &expired {
                assignments.remove((*experiment_id, request_id.as_str()))?;
            }

            let mut keys = txn.open_table(tables::ACCESS_KEYS)?;
            let mut retired: Vec<String> = Vec::new();
            for entry in keys.iter()? {
                let (k, v) = entry?;
                match bincode::deserialize::<StoredAccessKey>(v.value()) {
                    Ok(key) if !key.active && key.modified < cutoff => {
                        retired.push(k.value().to_string());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Failed to decode access key '{}': {}", k.value(), e),
                }
            }
            for key in &retired {
                keys.remove(key.as_str())?;
            }

            Ok(PurgeReport {
                assignments: expired.len(),
                access_keys: retired.len(),
            })
        })
    }
}

// ---- Generic helpers ----

fn next_id(txn: &WriteTransaction, sequence: &str) -> StoreResult<u64> {
    let mut table = txn.open_table(tables::SEQUENCES)?;
    let next = table.get(sequence)?.map_or(1, |v| v.value());
    table.insert(sequence, next + 1)?;
    Ok(next)
}

fn read_accounts(txn: &ReadTransaction) -> StoreResult<HashMap<AccountId, StoredAccount>> {
    let table = txn.open_table(tables::ACCOUNTS)?;
    let mut result = HashMap::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        match bincode::deserialize::<StoredAccount>(v.value()) {
            Ok(account) => {
                result.insert(k.value(), account);
            }
            Err(e) => error!("Failed to decode account '{}': {}", k.value(), e),
        }
    }
    Ok(result)
}

fn read_access_keys(txn: &ReadTransaction) -> StoreResult<Vec<StoredAccessKey>> {
    let table = txn.open_table(tables::ACCESS_KEYS)?;
    let mut result = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        match bincode::deserialize::<StoredAccessKey>(v.value()) {
            Ok(key) => result.push(key),
            Err(e) => error!("Failed to decode access key '{}': {}", k.value(), e),
        }
    }
    Ok(result)
}

fn read_experiments(txn: &ReadTransaction) -> StoreResult<Vec<StoredExperiment>> {
    let table = txn.open_table(tables::EXPERIMENTS)?;
    let mut result = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        match bincode::deserialize::<StoredExperiment>(v.value()) {
            Ok(exp) => result.push(exp),
            Err(e) => error!("Failed to decode experiment '{}': {}", k.value(), e),
        }
    }
    Ok(result)
}

#[async_trait]
impl ConfigStore for RedbStore {
    async fn current_time(&self) -> StoreResult<DateTime<Utc>> {
        self.blocking(|inner| Ok(inner.current_time())).await
    }

    async fn access_key_changes(&self, window: Window) -> StoreResult<Vec<AccessKeyRow>> {
        self.blocking(move |inner| {
            let read_txn = inner.db.begin_read()?;
            let accounts = read_accounts(&read_txn)?;
            let keys = read_access_keys(&read_txn)?;
            Ok(scan::access_key_rows(&accounts, &keys, window))
        })
        .await
    }

    async fn experiment_changes(&self, window: Window) -> StoreResult<Vec<ExperimentBranchRow>> {
        self.blocking(move |inner| {
            let read_txn = inner.db.begin_read()?;
            let accounts = read_accounts(&read_txn)?;
            let experiments = read_experiments(&read_txn)?;
            Ok(scan::experiment_rows(&accounts, &experiments, window))
        })
        .await
    }
}

#[async_trait]
impl LedgerStore for RedbStore {
    async fn upsert_assignment(&self, new: NewAssignment) -> StoreResult<Assignment> {
        self.blocking(move |inner| inner.upsert_assignment(new)).await
    }
}

#[async_trait]
impl UsageStore for RedbStore {
    async fn record_hit(&self, experiment_id: ExperimentId) -> StoreResult<()> {
        self.blocking(move |inner| {
            inner.update_experiment(experiment_id, false, |e, _| e.hits += 1)
        })
        .await
    }

    async fn touch_access_key(&self, access_key: &str) -> StoreResult<()> {
        let access_key = access_key.to_string();
        self.blocking(move |inner| {
            inner.update_access_key(&access_key, false, |k, now| k.last_used = Some(now))
        })
        .await
    }

    async fn touch_branch(&self, experiment_id: ExperimentId, branch: &str) -> StoreResult<()> {
        let branch = branch.to_string();
        self.blocking(move |inner| {
            inner.update_experiment(experiment_id, false, |e, now| {
                if let Some(b) = e.branches.iter_mut().find(|b| b.branch.value == branch) {
                    b.last_used = Some(now);
                }
            })
        })
        .await
    }
}

#[async_trait]
impl MaintenanceStore for RedbStore {
    async fn purge_expired(&self, grace: Duration) -> StoreResult<PurgeReport> {
        let grace = TimeDelta::from_std(grace).unwrap_or(TimeDelta::MAX);
        self.blocking(move |inner| inner.purge_expired(grace)).await
    }
}

impl ConfigAdmin for RedbStore {
    fn create_account(&self) -> StoreResult<AccountId> {
        self.inner.write(|txn, now| {
            let account_id = next_id(txn, tables::ACCOUNT_SEQ)?;
            let account = StoredAccount {
                account_id,
                active: true,
                modified: now,
            };
            let mut table = txn.open_table(tables::ACCOUNTS)?;
            table.insert(account_id, bincode::serialize(&account)?.as_slice())?;
            Ok(account_id)
        })
    }

    fn set_account_active(&self, account_id: AccountId, active: bool) -> StoreResult<()> {
        self.inner.update_account(account_id, |a| a.active = active)
    }

    fn insert_access_key(&self, account_id: AccountId, access_key: &str) -> StoreResult<()> {
        self.inner.write(|txn, now| {
            {
                let accounts = txn.open_table(tables::ACCOUNTS)?;
                let account: StoredAccount = match accounts.get(account_id)? {
                    Some(v) => bincode::deserialize(v.value())?,
                    None => return Err(StoreError::AccountNotFound(account_id)),
                };
                if !account.active {
                    return Err(StoreError::AccountInactive(account_id));
                }
            }
            let mut table = txn.open_table(tables::ACCESS_KEYS)?;
            if table.get(access_key)?.is_some() {
                return Err(StoreError::DuplicateAccessKey);
            }
            let key = StoredAccessKey {
                access_key: access_key.to_string(),
                account_id,
                active: true,
                modified: now,
                last_used: None,
            };
            table.insert(access_key, bincode::serialize(&key)?.as_slice())?;
            Ok(())
        })
    }

    fn set_access_key_active(&self, access_key: &str, active: bool) -> StoreResult<()> {
        self.inner
            .update_access_key(access_key, true, |k, _| k.active = active)
    }

    fn create_experiment(
        &self,
        account_id: AccountId,
        draft: ExperimentDraft,
    ) -> StoreResult<CreatedExperiment> {
        validate_branches(&draft.branches)?;
        let experiment_key = draft
            .experiment_key
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.inner.write(|txn, now| {
            if txn.open_table(tables::ACCOUNTS)?.get(account_id)?.is_none() {
                return Err(StoreError::AccountNotFound(account_id));
            }
            {
                let table = txn.open_table(tables::EXPERIMENTS)?;
                for entry in table.iter()? {
                    let (k, v) = entry?;
                    match bincode::deserialize::<StoredExperiment>(v.value()) {
                        Ok(exp)
                            if exp.account_id == account_id
                                && exp.experiment_key == experiment_key =>
                        {
                            return Err(StoreError::DuplicateExperimentKey(
                                experiment_key.clone(),
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => error!("Failed to decode experiment '{}': {}", k.value(), e),
                    }
                }
            }

            let experiment_id = next_id(txn, tables::EXPERIMENT_SEQ)?;
            let exp = StoredExperiment {
                experiment_id,
                account_id,
                experiment_key: experiment_key.clone(),
                request_ttl_secs: draft.request_ttl_secs,
                running: draft.running,
                active: true,
                hits: 0,
                modified: now,
                branches: stored_branches(draft.branches),
            };
            let mut table = txn.open_table(tables::EXPERIMENTS)?;
            table.insert(experiment_id, bincode::serialize(&exp)?.as_slice())?;
            Ok(CreatedExperiment {
                experiment_id,
                experiment_key,
            })
        })
    }

    fn replace_branches(
        &self,
        experiment_id: ExperimentId,
        branches: Vec<Branch>,
    ) -> StoreResult<()> {
        validate_branches(&branches)?;
        self.inner.update_experiment(experiment_id, true, |e, _| {
            e.branches = stored_branches(branches);
        })
    }

    fn set_experiment_running(
        &self,
        experiment_id: ExperimentId,
        running: bool,
    ) -> StoreResult<()> {
        self.inner
            .update_experiment(experiment_id, true, |e, _| e.running = running)
    }

    fn set_experiment_active(&self, experiment_id: ExperimentId, active: bool) -> StoreResult<()> {
        self.inner
            .update_experiment(experiment_id, true, |e, _| e.active = active)
    }

    fn set_request_ttl(
        &self,
        experiment_id: ExperimentId,
        request_ttl_secs: u32,
    ) -> StoreResult<()> {
        self.inner.update_experiment(experiment_id, true, |e, _| {
            e.request_ttl_secs = request_ttl_secs;
        })
    }

    fn experiment_hits(&self, experiment_id: ExperimentId) -> StoreResult<u64> {
        Ok(self.inner.get_experiment(experiment_id)?.hits)
    }

    fn access_key_last_used(&self, access_key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.inner.get_access_key(access_key)?.last_used)
    }

    fn branch_last_used(
        &self,
        experiment_id: ExperimentId,
        branch: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let exp = self.inner.get_experiment(experiment_id)?;
        Ok(exp
            .branches
            .iter()
            .find(|b| b.branch.value == branch)
            .and_then(|b| b.last_used))
    }
}
