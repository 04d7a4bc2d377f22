//! In-process mirror of access-key and experiment configuration.
//!
//! Readers (the resolver) never block on I/O. Writers (the sync job) only
//! insert, replace, or remove whole entries, so a reader never sees a
//! half-updated `ExperimentConfig`.

use dashmap::DashMap;
use dialr_common::{AccountId, ExperimentConfig};
use std::sync::Arc;

/// Replicated configuration cache
#[derive(Debug, Default)]
pub struct StateCache {
    owners: DashMap<String, AccountId>,
    experiments: DashMap<AccountId, DashMap<String, Arc<ExperimentConfig>>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account owning an active access key
    pub fn owner_of(&self, access_key: &str) -> Option<AccountId> {
        self.owners.get(access_key).map(|owner| *owner)
    }

    /// Current configuration of an experiment; a branchless experiment is
    /// present with an empty branch list
    pub fn experiment(&self, owner: AccountId, experiment_key: &str) -> Option<Arc<ExperimentConfig>> {
        self.experiments
            .get(&owner)?
            .get(experiment_key)
            .map(|config| Arc::clone(config.value()))
    }

    pub fn access_key_count(&self) -> usize {
        self.owners.len()
    }

    pub fn experiment_count(&self) -> usize {
        self.experiments.iter().map(|account| account.len()).sum()
    }

    pub(crate) fn put_owner(&self, access_key: String, owner: AccountId) {
        self.owners.insert(access_key, owner);
    }

    pub(crate) fn remove_owner(&self, access_key: &str) {
        self.owners.remove(access_key);
    }

    pub(crate) fn put_experiment(
        &self,
        owner: AccountId,
        experiment_key: String,
        config: ExperimentConfig,
    ) {
        self.experiments
            .entry(owner)
            .or_default()
            .insert(experiment_key, Arc::new(config));
    }

    pub(crate) fn remove_experiment(&self, owner: AccountId, experiment_key: &str) {
        if let Some(account) = self.experiments.get(&owner) {
            account.remove(experiment_key);
        }
    }

    /// Drop every experiment of an account
    pub(crate) fn remove_account(&self, owner: AccountId) {
        self.experiments.remove(&owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialr_common::Branch;

    fn config(id: u64) -> ExperimentConfig {
        ExperimentConfig::new(id, 60, vec![Branch::new("A", 1)])
    }

    #[test]
    fn test_owner_lookup() {
        let state = StateCache::new();
        state.put_owner("key-1".into(), 7);
        assert_eq!(state.owner_of("key-1"), Some(7));
        assert_eq!(state.owner_of("key-2"), None);

        state.remove_owner("key-1");
        assert_eq!(state.owner_of("key-1"), None);
    }

    #[test]
    fn test_experiments_are_scoped_by_owner() {
        let state = StateCache::new();
        state.put_experiment(1, "checkout".into(), config(10));
        state.put_experiment(2, "checkout".into(), config(20));

        assert_eq!(state.experiment(1, "checkout").unwrap().experiment_id(), 10);
        assert_eq!(state.experiment(2, "checkout").unwrap().experiment_id(), 20);
        assert!(state.experiment(3, "checkout").is_none());
        assert_eq!(state.experiment_count(), 2);
    }

    #[test]
    fn test_replace_is_whole_entry() {
        let state = StateCache::new();
        state.put_experiment(1, "checkout".into(), config(10));
        let before = state.experiment(1, "checkout").unwrap();

        state.put_experiment(
            1,
            "checkout".into(),
            ExperimentConfig::new(10, 60, vec![Branch::new("B", 2)]),
        );

        // A reader holding the old snapshot keeps a consistent view
        assert_eq!(before.branches()[0].value, "A");
        assert_eq!(before.probability_sum(), 1);
        let after = state.experiment(1, "checkout").unwrap();
        assert_eq!(after.branches()[0].value, "B");
        assert_eq!(after.probability_sum(), 2);
    }

    #[test]
    fn test_remove_account_drops_all_experiments() {
        let state = StateCache::new();
        state.put_experiment(1, "a".into(), config(10));
        state.put_experiment(1, "b".into(), config(11));
        state.put_experiment(2, "c".into(), config(12));

        state.remove_account(1);
        assert!(state.experiment(1, "a").is_none());
        assert!(state.experiment(1, "b").is_none());
        assert!(state.experiment(2, "c").is_some());

        state.remove_experiment(2, "c");
        assert_eq!(state.experiment_count(), 0);
    }
}
