//! Engine error types

use dialr_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single resolution call
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("access key is required")]
    MissingAccessKey,
    #[error("experiment key is required")]
    MissingExperimentKey,
    #[error("request id is required")]
    MissingRequestId,
    #[error("access key is not valid")]
    InvalidAccessKey,
    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),
    #[error("experiment {0} has no selectable branches")]
    MisconfiguredExperiment(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("ledger upsert timed out after {0:?}")]
    LedgerTimeout(Duration),
}

impl ResolveError {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingAccessKey => "missing-access-key",
            Self::MissingExperimentKey => "missing-experiment-key",
            Self::MissingRequestId => "missing-request-id",
            Self::InvalidAccessKey => "invalid-access-key",
            Self::UnknownExperiment(_) => "unknown-experiment",
            Self::MisconfiguredExperiment(_) => "misconfigured-experiment",
            Self::Store(_) | Self::LedgerTimeout(_) => "server-error",
        }
    }

    /// Caller-input failures; never retried and never logged as failures
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::LedgerTimeout(_))
    }

    /// HTTP status for this error
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        if self.is_client_error() { 400 } else { 500 }
    }
}

/// Failure of a sync cycle
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
