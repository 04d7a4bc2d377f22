//! Stored row types, query rows, and administrative drafts.
//!
//! Stored types are serialized to redb via bincode; `MemoryStore` keeps the
//! same types in plain maps so both stores share the change-scan logic.

use chrono::{DateTime, Utc};
use dialr_common::{AccountId, Branch, ExperimentId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{StoreError, StoreResult};

// ---- Stored rows ----

/// An owning account
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAccount {
    pub account_id: AccountId,
    pub active: bool,
    pub modified: DateTime<Utc>,
}

/// An access key mapped to its owning account
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAccessKey {
    pub access_key: String,
    pub account_id: AccountId,
    pub active: bool,
    pub modified: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// A branch as persisted, with its usage timestamp
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredBranch {
    pub branch: Branch,
    pub last_used: Option<DateTime<Utc>>,
}

/// An experiment with its branches embedded in sort order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredExperiment {
    pub experiment_id: ExperimentId,
    pub account_id: AccountId,
    pub experiment_key: String,
    pub request_ttl_secs: u32,
    pub running: bool,
    pub active: bool,
    pub hits: u64,
    pub modified: DateTime<Utc>,
    pub branches: Vec<StoredBranch>,
}

/// A ledger row; the `(experiment_id, request_id)` pair is the table key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredAssignment {
    pub branch: String,
    pub expiry: DateTime<Utc>,
    pub outcome: Option<String>,
}

// ---- Change query rows ----

/// An access key whose own row or owning account changed in a window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessKeyRow {
    pub access_key: String,
    pub account_id: AccountId,
    pub account_active: bool,
    pub key_active: bool,
}

/// One branch of an experiment whose own row or owning account changed in a
/// window. A branchless experiment yields exactly one row with `branch: None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExperimentBranchRow {
    pub account_id: AccountId,
    pub account_active: bool,
    pub experiment_id: ExperimentId,
    pub experiment_key: String,
    pub request_ttl_secs: u32,
    pub running: bool,
    pub experiment_active: bool,
    pub branch: Option<Branch>,
}

// ---- Ledger / maintenance ----

/// A candidate assignment submitted to the ledger
#[derive(Clone, Debug)]
pub struct NewAssignment {
    pub experiment_id: ExperimentId,
    pub request_id: String,
    pub branch: String,
    pub ttl_secs: u32,
    pub outcome: Option<String>,
}

/// Rows removed by one maintenance pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub assignments: usize,
    pub access_keys: usize,
}

impl std::fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "purged {} assignments, {} access keys",
            self.assignments, self.access_keys
        )
    }
}

// ---- Administrative drafts ----

/// Input for creating an experiment
#[derive(Clone, Debug)]
pub struct ExperimentDraft {
    /// Caller-facing key; a UUID is generated when absent
    pub experiment_key: Option<String>,
    pub request_ttl_secs: u32,
    pub running: bool,
    pub branches: Vec<Branch>,
}

impl ExperimentDraft {
    /// A running experiment with the given branches
    pub fn running(request_ttl_secs: u32, branches: Vec<Branch>) -> Self {
        Self {
            experiment_key: None,
            request_ttl_secs,
            running: true,
            branches,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.experiment_key = Some(key.into());
        self
    }
}

/// Identifiers of a newly created experiment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedExperiment {
    pub experiment_id: ExperimentId,
    pub experiment_key: String,
}

/// Reject branch lists that repeat a value
pub(crate) fn validate_branches(branches: &[Branch]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(branches.len());
    for branch in branches {
        if !seen.insert(branch.value.as_str()) {
            return Err(StoreError::DuplicateBranch(branch.value.clone()));
        }
    }
    Ok(())
}

pub(crate) fn stored_branches(branches: Vec<Branch>) -> Vec<StoredBranch> {
    branches
        .into_iter()
        .map(|branch| StoredBranch {
            branch,
            last_used: None,
        })
        .collect()
}

/// Generate an access key token (32 alphanumeric characters)
pub(crate) fn generate_access_key() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();

    (0..32)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_access_key() {
        let key = generate_access_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, generate_access_key());
    }

    #[test]
    fn test_duplicate_branch_rejected() {
        let branches = vec![Branch::new("A", 1), Branch::new("A", 2)];
        assert!(matches!(
            validate_branches(&branches),
            Err(StoreError::DuplicateBranch(v)) if v == "A"
        ));
        assert!(validate_branches(&[Branch::new("A", 1), Branch::new("B", 1)]).is_ok());
    }
}
