//! Change-window scans shared by the store implementations.

use dialr_common::{AccountId, Window};
use std::collections::HashMap;

use crate::types::{
    AccessKeyRow, ExperimentBranchRow, StoredAccessKey, StoredAccount, StoredExperiment,
};

fn account_changed(
    accounts: &HashMap<AccountId, StoredAccount>,
    account_id: AccountId,
    window: Window,
) -> bool {
    accounts
        .get(&account_id)
        .is_some_and(|a| window.contains(a.modified))
}

fn account_active(accounts: &HashMap<AccountId, StoredAccount>, account_id: AccountId) -> bool {
    accounts.get(&account_id).is_some_and(|a| a.active)
}

/// Access keys whose own row or owning account changed in `window`
pub(crate) fn access_key_rows<'a>(
    accounts: &HashMap<AccountId, StoredAccount>,
    keys: impl IntoIterator<Item = &'a StoredAccessKey>,
    window: Window,
) -> Vec<AccessKeyRow> {
    keys.into_iter()
        .filter(|k| window.contains(k.modified) || account_changed(accounts, k.account_id, window))
        .map(|k| AccessKeyRow {
            access_key: k.access_key.clone(),
            account_id: k.account_id,
            account_active: account_active(accounts, k.account_id),
            key_active: k.active,
        })
        .collect()
}

/// Experiment/branch rows whose experiment or owning account changed in
/// `window`, ordered by experiment key and then branch order.
pub(crate) fn experiment_rows<'a>(
    accounts: &HashMap<AccountId, StoredAccount>,
    experiments: impl IntoIterator<Item = &'a StoredExperiment>,
    window: Window,
) -> Vec<ExperimentBranchRow> {
    let mut changed: Vec<&StoredExperiment> = experiments
        .into_iter()
        .filter(|e| window.contains(e.modified) || account_changed(accounts, e.account_id, window))
        .collect();
    changed.sort_by(|a, b| a.experiment_key.cmp(&b.experiment_key));

    let mut rows = Vec::new();
    for exp in changed {
        let row = |branch| ExperimentBranchRow {
            account_id: exp.account_id,
            account_active: account_active(accounts, exp.account_id),
            experiment_id: exp.experiment_id,
            experiment_key: exp.experiment_key.clone(),
            request_ttl_secs: exp.request_ttl_secs,
            running: exp.running,
            experiment_active: exp.active,
            branch,
        };
        if exp.branches.is_empty() {
            rows.push(row(None));
        } else {
            rows.extend(exp.branches.iter().map(|b| row(Some(b.branch.clone()))));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoredBranch;
    use chrono::{DateTime, TimeDelta, Utc};
    use dialr_common::Branch;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    fn account(id: AccountId, active: bool, modified: i64) -> StoredAccount {
        StoredAccount {
            account_id: id,
            active,
            modified: at(modified),
        }
    }

    fn experiment(id: u64, key: &str, modified: i64, branches: &[&str]) -> StoredExperiment {
        StoredExperiment {
            experiment_id: id,
            account_id: 1,
            experiment_key: key.to_string(),
            request_ttl_secs: 60,
            running: true,
            active: true,
            hits: 0,
            modified: at(modified),
            branches: branches
                .iter()
                .map(|v| StoredBranch {
                    branch: Branch::new(*v, 1),
                    last_used: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_access_key_rows_follow_account_changes() {
        let accounts = HashMap::from([(1, account(1, false, 15))]);
        let keys = [
            StoredAccessKey {
                access_key: "k1".into(),
                account_id: 1,
                active: true,
                modified: at(1),
                last_used: None,
            },
            StoredAccessKey {
                access_key: "k2".into(),
                account_id: 2,
                active: true,
                modified: at(1),
                last_used: None,
            },
        ];

        let rows = access_key_rows(&accounts, &keys, Window::new(at(10), at(20)));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].access_key, "k1");
        assert!(!rows[0].account_active);
        assert!(rows[0].key_active);
    }

    #[test]
    fn test_experiment_rows_order_and_branchless() {
        let accounts = HashMap::from([(1, account(1, true, 0))]);
        let experiments = [
            experiment(1, "zeta", 12, &["A", "B"]),
            experiment(2, "alpha", 13, &[]),
            experiment(3, "mid", 5, &["X"]),
        ];

        let rows = experiment_rows(&accounts, &experiments, Window::new(at(10), at(20)));
        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r.experiment_key.as_str(), r.branch.as_ref().map(|b| b.value.as_str())))
            .collect();
        assert_eq!(
            keys,
            vec![("alpha", None), ("zeta", Some("A")), ("zeta", Some("B"))]
        );
    }
}
