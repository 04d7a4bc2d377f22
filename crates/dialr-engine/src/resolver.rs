//! Weighted, idempotent branch resolution.
//!
//! A cache hit is answered from memory. A miss draws a candidate branch and
//! submits it to the ledger, whose upsert returns whichever branch was
//! recorded first for the `(experiment, request id)` pair.

use chrono::{DateTime, Utc};
use dialr_common::{AccountId, Branch, Clock, ExperimentConfig, ExperimentId, SystemClock};
use dialr_store::{LedgerStore, NewAssignment, UsageStore};
use rand::Rng;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::assignments::{AssignmentCache, AssignmentKey};
use crate::error::ResolveError;
use crate::state::StateCache;

/// Source of uniform draws in `[0, upper)`
pub trait Draw: Send + Sync {
    fn draw(&self, upper: u64) -> u64;
}

/// Draws from the thread-local RNG
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRngDraw;

impl Draw for ThreadRngDraw {
    fn draw(&self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..upper)
    }
}

/// Caller-supplied attributes a `BranchFilter` may inspect
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub attributes: HashMap<String, String>,
}

impl RequestContext {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Restricts the candidate branches before the weighted draw
pub trait BranchFilter: Send + Sync {
    fn matches(&self, branch: &Branch, context: &RequestContext) -> bool;
}

/// One resolution call
#[derive(Clone, Debug, Default)]
pub struct ResolveRequest {
    pub access_key: String,
    pub experiment_key: String,
    pub request_id: String,
    pub outcome: Option<String>,
    pub context: RequestContext,
}

/// A resolved branch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub branch: String,
    pub expiry: DateTime<Utc>,
    /// Answered from the process-local cache
    pub cached: bool,
}

/// Walk `branches` in order and pick the first whose cumulative weight
/// exceeds `draw`. Weight-0 branches are never picked.
pub fn select_branch(branches: &[Branch], draw: u64) -> Option<&Branch> {
    let mut cumulative = 0u64;
    branches.iter().find(|branch| {
        cumulative += u64::from(branch.weight);
        cumulative > draw
    })
}

/// Resolves `(access key, experiment key, request id)` to a branch
pub struct BranchResolver {
    state: Arc<StateCache>,
    assignments: Arc<AssignmentCache>,
    ledger: Arc<dyn LedgerStore>,
    usage: Arc<dyn UsageStore>,
    ledger_timeout: Duration,
    clock: Arc<dyn Clock>,
    draw: Arc<dyn Draw>,
    filter: Option<Arc<dyn BranchFilter>>,
}

impl BranchResolver {
    pub fn new(
        state: Arc<StateCache>,
        assignments: Arc<AssignmentCache>,
        ledger: Arc<dyn LedgerStore>,
        usage: Arc<dyn UsageStore>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            state,
            assignments,
            ledger,
            usage,
            ledger_timeout,
            clock: Arc::new(SystemClock),
            draw: Arc::new(ThreadRngDraw),
            filter: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_draw(mut self, draw: Arc<dyn Draw>) -> Self {
        self.draw = draw;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn BranchFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> Result<Resolution, ResolveError> {
        let owner = self
            .state
            .owner_of(&request.access_key)
            .ok_or(ResolveError::InvalidAccessKey)?;

        let key = AssignmentKey::new(owner, &request.experiment_key, &request.request_id);
        if let Some(hit) = self
            .assignments
            .get(&key)
            .filter(|a| a.is_live_at(self.clock.now()))
        {
            debug!("Assignment cache hit for {}", request.experiment_key);
            self.record_usage(&request.access_key, hit.experiment_id, &hit.branch);
            return Ok(Resolution {
                branch: hit.branch,
                expiry: hit.expiry,
                cached: true,
            });
        }
        debug!("Assignment cache miss for {}", request.experiment_key);

        let config = self
            .state
            .experiment(owner, &request.experiment_key)
            .ok_or_else(|| ResolveError::UnknownExperiment(request.experiment_key.clone()))?;
        let candidate = self.pick(owner, &request.experiment_key, &config, &request.context)?;

        let new = NewAssignment {
            experiment_id: config.experiment_id(),
            request_id: request.request_id.clone(),
            branch: candidate,
            ttl_secs: config.request_ttl_secs(),
            outcome: request.outcome.clone(),
        };
        let assignment =
            match tokio::time::timeout(self.ledger_timeout, self.ledger.upsert_assignment(new))
                .await
            {
                Ok(Ok(assignment)) => assignment,
                Ok(Err(e)) => {
                    error!(
                        "Ledger upsert failed for experiment {}: {}",
                        config.experiment_id(),
                        e
                    );
                    return Err(e.into());
                }
                Err(_) => {
                    error!(
                        "Ledger upsert for experiment {} timed out after {}ms",
                        config.experiment_id(),
                        self.ledger_timeout.as_millis()
                    );
                    return Err(ResolveError::LedgerTimeout(self.ledger_timeout));
                }
            };

        if assignment.is_live_at(self.clock.now()) {
            self.assignments.insert(key, assignment.clone());
        }
        self.record_usage(&request.access_key, assignment.experiment_id, &assignment.branch);

        Ok(Resolution {
            branch: assignment.branch,
            expiry: assignment.expiry,
            cached: false,
        })
    }

    /// Draw a candidate branch value from the experiment's selectable set
    fn pick(
        &self,
        owner: AccountId,
        experiment_key: &str,
        config: &ExperimentConfig,
        context: &RequestContext,
    ) -> Result<String, ResolveError> {
        let misconfigured = || {
            debug!("Experiment {} of account {} is not servable", experiment_key, owner);
            ResolveError::MisconfiguredExperiment(experiment_key.to_string())
        };
        if !config.is_servable() {
            return Err(misconfigured());
        }

        let (candidates, sum) = self.candidates(config, context);
        if sum == 0 {
            return Err(misconfigured());
        }
        let draw = self.draw.draw(sum);
        select_branch(&candidates, draw)
            .map(|b| b.value.clone())
            .ok_or_else(misconfigured)
    }

    fn candidates<'a>(
        &self,
        config: &'a ExperimentConfig,
        context: &RequestContext,
    ) -> (Cow<'a, [Branch]>, u64) {
        let Some(filter) = &self.filter else {
            return (Cow::Borrowed(config.branches()), config.probability_sum());
        };

        let mut matched: Vec<Branch> = config
            .branches()
            .iter()
            .filter(|b| filter.matches(b, context))
            .cloned()
            .collect();
        if matched.is_empty() {
            matched = config
                .branches()
                .iter()
                .filter(|b| b.is_default)
                .cloned()
                .collect();
        }
        let sum = matched.iter().map(|b| u64::from(b.weight)).sum();
        (Cow::Owned(matched), sum)
    }

    /// Fire-and-forget usage bookkeeping; failures are only logged
    fn record_usage(&self, access_key: &str, experiment_id: ExperimentId, branch: &str) {
        let usage = Arc::clone(&self.usage);
        let access_key = access_key.to_string();
        let branch = branch.to_string();
        tokio::spawn(async move {
            if let Err(e) = usage.record_hit(experiment_id).await {
                error!("Failed to record hit for experiment {}: {}", experiment_id, e);
            }
            if let Err(e) = usage.touch_access_key(&access_key).await {
                error!("Failed to update access key last-used: {}", e);
            }
            if let Err(e) = usage.touch_branch(experiment_id, &branch).await {
                error!(
                    "Failed to update last-used of branch {} in experiment {}: {}",
                    branch, experiment_id, e
                );
            }
        });
    }
}
