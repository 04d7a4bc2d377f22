//! Periodic job harness and the maintenance job.
//!
//! Every tick of a periodic job is spawned as its own task, so a slow run can
//! overlap the next tick; `SingleFlight` turns such an overlap into a skip.

use async_trait::async_trait;
use dialr_store::{MaintenanceStore, PurgeReport, StoreError};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::single_flight::SingleFlight;

/// A unit of periodic background work
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Output: fmt::Display + Send;
    type Error: fmt::Display + Send;

    fn name(&self) -> &'static str;

    async fn execute(&self) -> Result<Self::Output, Self::Error>;
}

/// A job paired with its single-flight guard
pub struct Scheduled<J> {
    job: J,
    flight: SingleFlight,
}

impl<J: Job> Scheduled<J> {
    pub fn new(job: J) -> Self {
        let flight = SingleFlight::new(job.name());
        Self { job, flight }
    }

    pub const fn job(&self) -> &J {
        &self.job
    }

    pub const fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    /// Run the job unless a previous run is still in progress. Returns
    /// `None` when skipped.
    pub async fn run_once(&self) -> Option<Result<J::Output, J::Error>> {
        let _guard = self.flight.try_begin()?;

        let start = Instant::now();
        let result = self.job.execute().await;
        let elapsed_ms = start.elapsed().as_millis();
        match &result {
            Ok(output) => info!("{} finished in {}ms: {}", self.job.name(), elapsed_ms, output),
            Err(e) => error!("{} failed after {}ms: {}", self.job.name(), elapsed_ms, e),
        }
        Some(result)
    }
}

/// Long-running background task: run `scheduled` every `period`. The first
/// run happens one period after spawning.
pub fn spawn_periodic<J: Job>(scheduled: Arc<Scheduled<J>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting {} every {}ms",
            scheduled.job().name(),
            period.as_millis()
        );
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let scheduled = Arc::clone(&scheduled);
            tokio::spawn(async move {
                scheduled.run_once().await;
            });
        }
    })
}

/// Deletes expired assignments and retired access keys
pub struct MaintenanceJob {
    store: Arc<dyn MaintenanceStore>,
    grace: Duration,
}

impl MaintenanceJob {
    pub fn new(store: Arc<dyn MaintenanceStore>, grace: Duration) -> Self {
        Self { store, grace }
    }
}

#[async_trait]
impl Job for MaintenanceJob {
    type Output = PurgeReport;
    type Error = StoreError;

    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn execute(&self) -> Result<PurgeReport, StoreError> {
        self.store.purge_expired(self.grace).await
    }
}
