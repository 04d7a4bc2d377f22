//! Monotonic store clock.
//!
//! Every modification timestamp and every `current_time()` answer is issued
//! here. Stores advance it while holding their write lock, so a watermark
//! handed to the sync job never precedes an uncommitted write.

use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug)]
pub(crate) struct StoreClock {
    last: DateTime<Utc>,
}

impl StoreClock {
    pub(crate) const fn new(start: DateTime<Utc>) -> Self {
        Self { last: start }
    }

    /// Next timestamp: the wall time, or one microsecond past the previous
    /// stamp if the wall clock has not moved (or moved backwards).
    pub(crate) fn tick(&mut self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.last + TimeDelta::microseconds(1);
        self.last = if wall > floor { wall } else { floor };
        self.last
    }
}
