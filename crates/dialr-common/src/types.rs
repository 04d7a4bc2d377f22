//! Core domain types
//!
//! These types describe experiment configuration as it is served from memory
//! and the durable branch assignments recorded in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an owning account
pub type AccountId = u64;

/// Identifier of an experiment (durable, store-assigned)
pub type ExperimentId = u64;

/// One labeled outcome of an experiment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Label returned to the caller, unique within its experiment
    pub value: String,
    /// Relative selection weight; a weight of 0 is never selected
    pub weight: u32,
    /// Marks the unfiltered fallback branch
    #[serde(default)]
    pub is_default: bool,
    /// Audience filter expression, not evaluated by the engine itself
    #[serde(default)]
    pub filter: Option<String>,
}

impl Branch {
    /// Create an unfiltered branch
    pub fn new(value: impl Into<String>, weight: u32) -> Self {
        Self {
            value: value.into(),
            weight,
            is_default: false,
            filter: None,
        }
    }

    /// Mark this branch as the default (unfiltered) branch
    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Attach a filter expression
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Materialized configuration of a servable experiment
///
/// `probability_sum` always equals the sum of the branch weights: the fields
/// are private and the sum is computed on construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExperimentConfig {
    experiment_id: ExperimentId,
    request_ttl_secs: u32,
    branches: Vec<Branch>,
    probability_sum: u64,
}

impl ExperimentConfig {
    /// Build a config from its branches in stored order
    pub fn new(experiment_id: ExperimentId, request_ttl_secs: u32, branches: Vec<Branch>) -> Self {
        let probability_sum = branches.iter().map(|b| u64::from(b.weight)).sum();
        Self {
            experiment_id,
            request_ttl_secs,
            branches,
            probability_sum,
        }
    }

    #[must_use]
    pub const fn experiment_id(&self) -> ExperimentId {
        self.experiment_id
    }

    /// Seconds an assignment stays durable
    #[must_use]
    pub const fn request_ttl_secs(&self) -> u32 {
        self.request_ttl_secs
    }

    #[must_use]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// Sum of all branch weights; the draw range is `[0, probability_sum)`
    #[must_use]
    pub const fn probability_sum(&self) -> u64 {
        self.probability_sum
    }

    /// Whether a branch can be selected at all
    #[must_use]
    pub fn is_servable(&self) -> bool {
        !self.branches.is_empty() && self.probability_sum > 0
    }
}

/// A durable, idempotent branch assignment for one `(experiment, request id)`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub experiment_id: ExperimentId,
    pub branch: String,
    pub expiry: DateTime<Utc>,
}

impl Assignment {
    /// Whether the assignment is still valid at `now`
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

/// Open-closed interval `(after, until]` of store modification times
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub after: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Window {
    #[must_use]
    pub const fn new(after: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self { after, until }
    }

    /// Check whether a modification time falls in the window
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t > self.after && t <= self.until
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_probability_sum_matches_weights() {
        let config = ExperimentConfig::new(
            1,
            60,
            vec![Branch::new("A", 3), Branch::new("B", 0), Branch::new("C", 7)],
        );
        assert_eq!(config.probability_sum(), 10);
        assert!(config.is_servable());
    }

    #[test]
    fn test_unservable_configs() {
        assert!(!ExperimentConfig::new(1, 60, Vec::new()).is_servable());
        assert!(!ExperimentConfig::new(1, 60, vec![Branch::new("A", 0)]).is_servable());
    }

    #[test]
    fn test_window_is_open_closed() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let t1 = t0 + TimeDelta::seconds(10);
        let window = Window::new(t0, t1);
        assert!(!window.contains(t0));
        assert!(window.contains(t0 + TimeDelta::seconds(1)));
        assert!(window.contains(t1));
        assert!(!window.contains(t1 + TimeDelta::microseconds(1)));
    }

    #[test]
    fn test_assignment_liveness() {
        let now = Utc::now();
        let assignment = Assignment {
            experiment_id: 1,
            branch: "A".into(),
            expiry: now,
        };
        assert!(!assignment.is_live_at(now));
        assert!(assignment.is_live_at(now - TimeDelta::seconds(1)));
    }
}
