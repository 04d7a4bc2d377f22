//! Engine wiring: caches, resolver, and the periodic jobs that feed them.

use chrono::{DateTime, Utc};
use dialr_common::{Clock, Config};
use dialr_store::{
    ConfigStore, LedgerStore, MaintenanceStore, PurgeReport, StoreError, UsageStore,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assignments::AssignmentCache;
use crate::error::{ResolveError, SyncError};
use crate::jobs::{MaintenanceJob, Scheduled, spawn_periodic};
use crate::resolver::{BranchFilter, BranchResolver, Draw, Resolution, ResolveRequest};
use crate::state::StateCache;
use crate::sync::{SyncJob, SyncReport};

/// Every store contract the engine needs
pub trait Backend: ConfigStore + LedgerStore + UsageStore + MaintenanceStore + 'static {}

impl<T> Backend for T where T: ConfigStore + LedgerStore + UsageStore + MaintenanceStore + 'static {}

/// Branch resolution engine
pub struct Engine {
    state: Arc<StateCache>,
    assignments: Arc<AssignmentCache>,
    resolver: BranchResolver,
    sync: Arc<Scheduled<SyncJob>>,
    maintenance: Arc<Scheduled<MaintenanceJob>>,
    sync_interval: Duration,
    maintenance_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new<S: Backend>(store: Arc<S>, config: &Config) -> Self {
        let state = Arc::new(StateCache::new());
        let assignments = Arc::new(AssignmentCache::new());

        let config_store: Arc<dyn ConfigStore> = Arc::clone(&store) as Arc<dyn ConfigStore>;
        let ledger: Arc<dyn LedgerStore> = Arc::clone(&store) as Arc<dyn LedgerStore>;
        let usage: Arc<dyn UsageStore> = Arc::clone(&store) as Arc<dyn UsageStore>;
        let maintenance_store: Arc<dyn MaintenanceStore> = store;

        let resolver = BranchResolver::new(
            Arc::clone(&state),
            Arc::clone(&assignments),
            ledger,
            usage,
            config.resolver.ledger_timeout(),
        );
        let sync = SyncJob::new(config_store, Arc::clone(&state), Arc::clone(&assignments));
        let maintenance = MaintenanceJob::new(maintenance_store, config.maintenance.grace());

        Self {
            state,
            assignments,
            resolver,
            sync: Arc::new(Scheduled::new(sync)),
            maintenance: Arc::new(Scheduled::new(maintenance)),
            sync_interval: config.sync.interval(),
            maintenance_interval: config.maintenance.interval(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.resolver = self.resolver.with_clock(clock);
        self
    }

    #[must_use]
    pub fn with_draw(mut self, draw: Arc<dyn Draw>) -> Self {
        self.resolver = self.resolver.with_draw(draw);
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn BranchFilter>) -> Self {
        self.resolver = self.resolver.with_filter(filter);
        self
    }

    /// Load state once, then start the periodic sync and maintenance jobs.
    /// A failed initial load is logged and retried on the next tick. Calling
    /// it again while the jobs run does nothing.
    pub async fn start(&self) {
        if !self.tasks.lock().is_empty() {
            warn!("Engine already started");
            return;
        }

        match self.refresh_now().await {
            Some(Ok(report)) => info!(
                "Initial state loaded: {} access keys, {} experiments",
                report.access_keys, report.experiments
            ),
            Some(Err(_)) => warn!("Initial state load failed, serving from an empty cache"),
            None => {}
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(spawn_periodic(Arc::clone(&self.sync), self.sync_interval));
        tasks.push(spawn_periodic(
            Arc::clone(&self.maintenance),
            self.maintenance_interval,
        ));
    }

    /// Stop the periodic jobs
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if !tasks.is_empty() {
            info!("Stopping {} background jobs", tasks.len());
        }
        for task in tasks {
            task.abort();
        }
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> Result<Resolution, ResolveError> {
        self.resolver.resolve(request).await
    }

    /// Run a sync cycle now, through the same guard as the timer. Returns
    /// `None` when a cycle is already running.
    pub async fn refresh_now(&self) -> Option<Result<SyncReport, SyncError>> {
        self.sync.run_once().await
    }

    /// Run a maintenance pass now, through the same guard as the timer
    pub async fn run_maintenance(&self) -> Option<Result<PurgeReport, StoreError>> {
        self.maintenance.run_once().await
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.sync.job().watermark()
    }

    pub fn state(&self) -> &StateCache {
        &self.state
    }

    pub fn assignments(&self) -> &AssignmentCache {
        &self.assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialr_common::Branch;
    use dialr_store::{ConfigAdmin, ExperimentDraft, MemoryStore, RedbStore};

    struct FixedDraw(u64);

    impl Draw for FixedDraw {
        fn draw(&self, upper: u64) -> u64 {
            self.0.min(upper.saturating_sub(1))
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.sync.interval_ms = 20;
        config.maintenance.interval_ms = 50;
        config
    }

    fn request(access_key: &str, experiment_key: &str, request_id: &str) -> ResolveRequest {
        ResolveRequest {
            access_key: access_key.into(),
            experiment_key: experiment_key.into(),
            request_id: request_id.into(),
            ..ResolveRequest::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_loads_and_timer_converges() {
        let store = Arc::new(MemoryStore::new());
        let account = store.create_account().unwrap();
        let key = store.create_access_key(account).unwrap();
        let exp = store
            .create_experiment(
                account,
                ExperimentDraft::running(60, vec![Branch::new("A", 1)]).with_key("first"),
            )
            .unwrap();

        let engine = Engine::new(Arc::clone(&store), &fast_config());
        engine.start().await;
        assert!(engine.resolve(&request(&key, "first", "rid")).await.is_ok());

        // Created after start: visible within a sync interval or so
        store
            .create_experiment(
                account,
                ExperimentDraft::running(60, vec![Branch::new("B", 1)]).with_key("second"),
            )
            .unwrap();
        store.set_experiment_running(exp.experiment_id, false).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            engine
                .resolve(&request(&key, "second", "rid"))
                .await
                .unwrap()
                .branch,
            "B"
        );
        assert!(engine.state().experiment(account, "first").is_none());
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_interval_still_syncs() {
        let store = Arc::new(MemoryStore::new());
        let account = store.create_account().unwrap();
        let key = store.create_access_key(account).unwrap();

        let mut config = Config::default();
        config.sync.interval_ms = 0;
        config.maintenance.interval_ms = 0;
        let engine = Engine::new(Arc::clone(&store), &config);
        engine.start().await;

        store
            .create_experiment(
                account,
                ExperimentDraft::running(60, vec![Branch::new("A", 1)]).with_key("late"),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(engine.resolve(&request(&key, "late", "rid")).await.is_ok());
        assert!(engine.tasks.lock().iter().all(|task| !task.is_finished()));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_second_start_spawns_nothing() {
        let engine = Engine::new(Arc::new(MemoryStore::new()), &Config::default());
        engine.start().await;
        engine.start().await;
        assert_eq!(engine.tasks.lock().len(), 2);
        engine.shutdown();
        assert!(engine.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_initial_load_still_starts() {
        let store = Arc::new(MemoryStore::new());
        store.fail_config_queries(true);
        let engine = Engine::new(Arc::clone(&store), &Config::default());
        engine.start().await;
        assert_eq!(engine.watermark(), DateTime::<Utc>::UNIX_EPOCH);

        store.fail_config_queries(false);
        assert!(matches!(engine.refresh_now().await, Some(Ok(_))));
        assert!(engine.watermark() > DateTime::<Utc>::UNIX_EPOCH);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_assignment_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dialr.redb");
        let branches = vec![Branch::new("A", 1), Branch::new("B", 1)];

        let (key, first, store) = {
            let store = Arc::new(RedbStore::open(&path).unwrap());
            let account = store.create_account().unwrap();
            let key = store.create_access_key(account).unwrap();
            store
                .create_experiment(
                    account,
                    ExperimentDraft::running(3600, branches).with_key("checkout"),
                )
                .unwrap();
            let engine = Engine::new(Arc::clone(&store), &Config::default())
                .with_draw(Arc::new(FixedDraw(0)));
            engine.refresh_now().await.unwrap().unwrap();
            let first = engine
                .resolve(&request(&key, "checkout", "rid"))
                .await
                .unwrap();
            (key, first, store)
        };
        assert_eq!(first.branch, "A");

        // Wait for the usage bookkeeping to release the database
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(store);

        // A fresh process whose draw would pick the other branch
        let store = Arc::new(RedbStore::open(&path).unwrap());
        let engine = Engine::new(store, &Config::default()).with_draw(Arc::new(FixedDraw(1)));
        engine.refresh_now().await.unwrap().unwrap();
        let again = engine
            .resolve(&request(&key, "checkout", "rid"))
            .await
            .unwrap();
        assert!(!again.cached);
        assert_eq!(again.branch, first.branch);
        assert_eq!(again.expiry, first.expiry);

        let other = engine
            .resolve(&request(&key, "checkout", "rid-2"))
            .await
            .unwrap();
        assert_eq!(other.branch, "B");
    }

    #[tokio::test]
    async fn test_run_maintenance() {
        let store = Arc::new(MemoryStore::new());
        let account = store.create_account().unwrap();
        let key = store.create_access_key(account).unwrap();
        store.set_access_key_active(&key, false).unwrap();

        let engine = Engine::new(Arc::clone(&store), &Config::default());
        let report = engine.run_maintenance().await.unwrap().unwrap();
        assert_eq!(report.access_keys, 0);

        store.advance_clock(Duration::from_secs(601));
        let report = engine.run_maintenance().await.unwrap().unwrap();
        assert_eq!(report.access_keys, 1);
    }
}
