//! Store error types

use dialr_common::{AccountId, ExperimentId};
use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("account is inactive: {0}")]
    AccountInactive(AccountId),
    #[error("access key not found: {0}")]
    AccessKeyNotFound(String),
    #[error("access key already exists")]
    DuplicateAccessKey,
    #[error("experiment not found: {0}")]
    ExperimentNotFound(ExperimentId),
    #[error("experiment key already exists: {0}")]
    DuplicateExperimentKey(String),
    #[error("duplicate branch value: {0}")]
    DuplicateBranch(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
