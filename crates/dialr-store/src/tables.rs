//! Redb table definitions for the durable store.

use redb::TableDefinition;

// Configuration
pub const ACCOUNTS: TableDefinition<u64, &[u8]> = TableDefinition::new("accounts");
pub const ACCESS_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("access_keys");
// Branches are embedded in the experiment value, in sort order
pub const EXPERIMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("experiments");

// Ledger
// Key: (experiment_id, request_id)
pub const ASSIGNMENTS: TableDefinition<(u64, &str), &[u8]> = TableDefinition::new("assignments");

// Id allocation
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub const ACCOUNT_SEQ: &str = "account";
pub const EXPERIMENT_SEQ: &str = "experiment";
