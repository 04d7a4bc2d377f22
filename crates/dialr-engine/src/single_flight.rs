//! Run-or-skip guard for periodic jobs.
//!
//! A process-local marker, not a distributed lock: replicas may run the same
//! job at the same time.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Suppresses overlapping executions of one job
#[derive(Debug)]
pub struct SingleFlight {
    name: &'static str,
    running_since: Mutex<Option<Instant>>,
}

impl SingleFlight {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running_since: Mutex::new(None),
        }
    }

    /// Mark the job as running. Returns `None`, and logs a warning, when a
    /// previous execution has not finished yet.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        let mut since = self.running_since.lock();
        if let Some(started) = *since {
            warn!(
                "Skipping {}: previous run still in progress after {}ms",
                self.name,
                started.elapsed().as_millis()
            );
            return None;
        }
        *since = Some(Instant::now());
        Some(FlightGuard { flight: self })
    }

    /// How long the current execution has been running
    pub fn running_for(&self) -> Option<Duration> {
        self.running_since.lock().map(|started| started.elapsed())
    }

    pub fn is_running(&self) -> bool {
        self.running_since.lock().is_some()
    }
}

/// Clears the running marker when dropped, including on failure or panic
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.flight.running_since.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_is_skipped() {
        let flight = SingleFlight::new("test");
        let guard = flight.try_begin();
        assert!(guard.is_some());
        assert!(flight.is_running());
        assert!(flight.try_begin().is_none());

        drop(guard);
        assert!(!flight.is_running());
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn test_marker_cleared_on_panic() {
        let flight = SingleFlight::new("test");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = flight.try_begin();
            panic!("job failed");
        }));
        assert!(result.is_err());
        assert!(!flight.is_running());
    }
}
