//! Incremental synchronization of the state cache.
//!
//! Each cycle reads the store's clock as the new watermark, pulls every row
//! changed in `(previous, new]`, and applies whole-entry replacements. The
//! watermark only advances when both change queries succeed, so a failed
//! cycle is retried over the same window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialr_common::{ExperimentConfig, Window};
use dialr_store::{AccessKeyRow, ConfigStore, ExperimentBranchRow};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::assignments::AssignmentCache;
use crate::error::SyncError;
use crate::jobs::Job;
use crate::state::StateCache;

/// Summary of one completed cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncReport {
    pub window: Window,
    pub access_keys: usize,
    pub experiments: usize,
    pub evicted: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} access keys, {} experiments changed, {} assignments evicted (watermark {})",
            self.access_keys,
            self.experiments,
            self.evicted,
            self.window.until.to_rfc3339()
        )
    }
}

/// Converges the `StateCache` with the config store
pub struct SyncJob {
    store: Arc<dyn ConfigStore>,
    state: Arc<StateCache>,
    assignments: Arc<AssignmentCache>,
    watermark: Mutex<DateTime<Utc>>,
}

impl SyncJob {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        state: Arc<StateCache>,
        assignments: Arc<AssignmentCache>,
    ) -> Self {
        Self {
            store,
            state,
            assignments,
            watermark: Mutex::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// Store time through which changes have been applied
    pub fn watermark(&self) -> DateTime<Utc> {
        *self.watermark.lock()
    }

    /// Run one sync cycle. Callers outside the crate go through `Scheduled`.
    pub(crate) async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let after = self.watermark();
        let until = self.store.current_time().await?;
        let window = Window::new(after, until);

        let changes = tokio::try_join!(
            self.store.access_key_changes(window),
            self.store.experiment_changes(window),
        );

        // Eviction only depends on the new store time
        let evicted = self.assignments.evict_expired(until);
        if evicted > 0 {
            debug!("Evicted {} expired assignments", evicted);
        }

        let (keys, rows) = changes?;
        let access_keys = self.apply_access_keys(keys);
        let experiments = self.apply_experiments(rows);
        {
            let mut watermark = self.watermark.lock();
            // Never move backwards, even if an older cycle finishes last
            *watermark = (*watermark).max(until);
        }

        Ok(SyncReport {
            window,
            access_keys,
            experiments,
            evicted,
        })
    }

    fn apply_access_keys(&self, rows: Vec<AccessKeyRow>) -> usize {
        let count = rows.len();
        for row in rows {
            if row.account_active && row.key_active {
                debug!("Mapping access key to account {}", row.account_id);
                self.state.put_owner(row.access_key, row.account_id);
            } else {
                debug!("Removing access key of account {}", row.account_id);
                self.state.remove_owner(&row.access_key);
            }
        }
        count
    }

    /// Group consecutive rows by experiment and apply one decision per group
    fn apply_experiments(&self, rows: Vec<ExperimentBranchRow>) -> usize {
        let mut count = 0;
        let mut rows = rows.into_iter().peekable();

        while let Some(head) = rows.next() {
            let mut branches: Vec<_> = head.branch.clone().into_iter().collect();
            while let Some(next) = rows.next_if(|r| r.experiment_id == head.experiment_id) {
                branches.extend(next.branch);
            }
            count += 1;

            if !head.account_active {
                debug!("Account {} inactive, dropping its experiments", head.account_id);
                self.state.remove_account(head.account_id);
            } else if !head.experiment_active || !head.running {
                debug!("Experiment {} stopped, removing", head.experiment_key);
                self.state
                    .remove_experiment(head.account_id, &head.experiment_key);
            } else {
                debug!(
                    "Experiment {} updated with {} branches",
                    head.experiment_key,
                    branches.len()
                );
                let config =
                    ExperimentConfig::new(head.experiment_id, head.request_ttl_secs, branches);
                self.state
                    .put_experiment(head.account_id, head.experiment_key, config);
            }
        }
        count
    }
}

#[async_trait]
impl Job for SyncJob {
    type Output = SyncReport;
    type Error = SyncError;

    fn name(&self) -> &'static str {
        "state-refresh"
    }

    async fn execute(&self) -> Result<SyncReport, SyncError> {
        self.run_cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use dialr_common::{Assignment, Branch};
    use dialr_store::{ConfigAdmin, ExperimentDraft, MemoryStore};

    use crate::assignments::AssignmentKey;
    use crate::jobs::Scheduled;

    struct Fixture {
        store: Arc<MemoryStore>,
        state: Arc<StateCache>,
        assignments: Arc<AssignmentCache>,
        sync: SyncJob,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(StateCache::new());
        let assignments = Arc::new(AssignmentCache::new());
        let sync = SyncJob::new(
            Arc::clone(&store) as Arc<dyn ConfigStore>,
            Arc::clone(&state),
            Arc::clone(&assignments),
        );
        Fixture {
            store,
            state,
            assignments,
            sync,
        }
    }

    fn branches() -> Vec<Branch> {
        vec![Branch::new("A", 1), Branch::new("B", 3)]
    }

    #[tokio::test]
    async fn test_initial_cycle_loads_everything() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        let key = f.store.create_access_key(account).unwrap();
        let exp = f
            .store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("checkout"))
            .unwrap();

        let report = f.sync.run_cycle().await.unwrap();
        assert_eq!(report.access_keys, 1);
        assert_eq!(report.experiments, 1);
        assert_eq!(f.sync.watermark(), report.window.until);

        assert_eq!(f.state.owner_of(&key), Some(account));
        let config = f.state.experiment(account, "checkout").unwrap();
        assert_eq!(config.experiment_id(), exp.experiment_id);
        assert_eq!(config.probability_sum(), 4);
        assert_eq!(config.branches().len(), 2);

        // Nothing changed since
        let report = f.sync.run_cycle().await.unwrap();
        assert_eq!(report.access_keys + report.experiments, 0);
    }

    #[tokio::test]
    async fn test_branchless_experiment_is_present() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        f.store
            .create_experiment(account, ExperimentDraft::running(60, Vec::new()).with_key("empty"))
            .unwrap();

        f.sync.run_cycle().await.unwrap();
        let config = f.state.experiment(account, "empty").unwrap();
        assert!(config.branches().is_empty());
        assert!(!config.is_servable());
    }

    #[tokio::test]
    async fn test_account_deactivation_and_experiment_reactivation() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        let key = f.store.create_access_key(account).unwrap();
        let a = f
            .store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("a"))
            .unwrap();
        f.store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("b"))
            .unwrap();
        f.sync.run_cycle().await.unwrap();
        assert_eq!(f.state.experiment_count(), 2);

        f.store.set_account_active(account, false).unwrap();
        f.sync.run_cycle().await.unwrap();
        assert_eq!(f.state.experiment_count(), 0);
        assert_eq!(f.state.owner_of(&key), None);

        f.store.set_account_active(account, true).unwrap();
        f.store.set_experiment_active(a.experiment_id, false).unwrap();
        f.sync.run_cycle().await.unwrap();
        assert!(f.state.experiment(account, "a").is_none());
        assert!(f.state.experiment(account, "b").is_some());
        assert_eq!(f.state.owner_of(&key), Some(account));

        f.store.set_experiment_active(a.experiment_id, true).unwrap();
        f.sync.run_cycle().await.unwrap();
        assert!(f.state.experiment(account, "a").is_some());
    }

    #[tokio::test]
    async fn test_stopped_experiment_and_revoked_key() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        let key = f.store.create_access_key(account).unwrap();
        let exp = f
            .store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("a"))
            .unwrap();
        f.sync.run_cycle().await.unwrap();

        f.store.set_experiment_running(exp.experiment_id, false).unwrap();
        f.store.set_access_key_active(&key, false).unwrap();
        f.sync.run_cycle().await.unwrap();
        assert!(f.state.experiment(account, "a").is_none());
        assert_eq!(f.state.owner_of(&key), None);
    }

    #[tokio::test]
    async fn test_branch_replacement_recomputes_sum() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        let exp = f
            .store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("a"))
            .unwrap();
        f.sync.run_cycle().await.unwrap();

        f.store
            .replace_branches(exp.experiment_id, vec![Branch::new("C", 10)])
            .unwrap();
        f.sync.run_cycle().await.unwrap();
        let config = f.state.experiment(account, "a").unwrap();
        assert_eq!(config.probability_sum(), 10);
        assert_eq!(config.branches()[0].value, "C");
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_watermark_and_retries_window() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        f.sync.run_cycle().await.unwrap();
        let watermark = f.sync.watermark();

        f.store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("late"))
            .unwrap();
        f.store.fail_config_queries(true);
        assert!(f.sync.run_cycle().await.is_err());
        assert_eq!(f.sync.watermark(), watermark);
        assert!(f.state.experiment(account, "late").is_none());

        f.store.fail_config_queries(false);
        let report = f.sync.run_cycle().await.unwrap();
        assert_eq!(report.window.after, watermark);
        assert!(f.state.experiment(account, "late").is_some());
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let f = fixture();
        f.store.create_account().unwrap();

        // A newer cycle already committed a later watermark
        let ahead = f.store.current_time().await.unwrap() + TimeDelta::hours(1);
        *f.sync.watermark.lock() = ahead;

        f.sync.run_cycle().await.unwrap();
        assert_eq!(f.sync.watermark(), ahead);
    }

    #[tokio::test]
    async fn test_evicts_assignments_expired_at_new_watermark() {
        let f = fixture();
        let now = f.store.current_time().await.unwrap();
        let stale = AssignmentKey::new(1, "a", "old");
        let live = AssignmentKey::new(1, "a", "new");
        f.assignments.insert(
            stale.clone(),
            Assignment {
                experiment_id: 1,
                branch: "A".into(),
                expiry: now,
            },
        );
        f.assignments.insert(
            live.clone(),
            Assignment {
                experiment_id: 1,
                branch: "A".into(),
                expiry: now + TimeDelta::hours(1),
            },
        );

        let report = f.sync.run_cycle().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!f.assignments.contains(&stale));
        assert!(f.assignments.contains(&live));
    }

    #[tokio::test]
    async fn test_skipped_cycle_does_not_touch_watermark() {
        let f = fixture();
        let account = f.store.create_account().unwrap();
        let scheduled = Scheduled::new(f.sync);
        scheduled.run_once().await.unwrap().unwrap();
        let watermark = scheduled.job().watermark();
        let calls = f.store.config_calls();

        f.store
            .create_experiment(account, ExperimentDraft::running(60, branches()).with_key("a"))
            .unwrap();
        {
            let _running = scheduled.flight().try_begin().unwrap();
            assert!(scheduled.run_once().await.is_none());
        }
        assert_eq!(f.store.config_calls(), calls);
        assert_eq!(scheduled.job().watermark(), watermark);
        assert!(f.state.experiment(account, "a").is_none());

        scheduled.run_once().await.unwrap().unwrap();
        assert!(f.state.experiment(account, "a").is_some());
    }
}
