//! Process-local cache of ledger assignments.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dialr_common::{AccountId, Assignment};

/// Identity of one resolution: the owning account, the experiment key the
/// caller used, and the caller's request id
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AssignmentKey {
    pub account_id: AccountId,
    pub experiment_key: String,
    pub request_id: String,
}

impl AssignmentKey {
    pub fn new(account_id: AccountId, experiment_key: &str, request_id: &str) -> Self {
        Self {
            account_id,
            experiment_key: experiment_key.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Cache of live assignments, filled by the resolver and pruned by sync
#[derive(Debug, Default)]
pub struct AssignmentCache {
    entries: DashMap<AssignmentKey, Assignment>,
}

impl AssignmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &AssignmentKey) -> Option<Assignment> {
        self.entries.get(key).map(|a| a.value().clone())
    }

    pub fn contains(&self, key: &AssignmentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&self, key: AssignmentKey, assignment: Assignment) {
        self.entries.insert(key, assignment);
    }

    /// Drop entries that are no longer live at `now`, returning how many
    /// were removed
    pub(crate) fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, a| a.is_live_at(now));
        before.saturating_sub(self.entries.len())
    }
}
