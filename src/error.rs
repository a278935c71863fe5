#![allow(missing_docs)]

use bson::document::ValueAccessError;
use std::result::Result as StdResult;
use thiserror::Error;

/// Error kinds used across the replication core.
///
/// Most entry points return these as values; the only panics left are fatal
/// batch-apply failures outside of initial sync.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplError {
    #[error("callback canceled")]
    CallbackCanceled,
    #[error("oplog start missing: {0}")]
    OplogStartMissing(String),
    #[error("invalid sync source: {0}")]
    InvalidSyncSource(String),
    #[error("initial sync failure: {0}")]
    InitialSyncFailure(String),
    #[error("failed to parse remote response: {0}")]
    FailedToParse(String),
    #[error("bad value: {0}")]
    BadValue(String),
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
    #[error("invalid role modification: {0}")]
    InvalidRoleModification(String),
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote command failed: {0}")]
    CommandFailed(String),
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl From<ValueAccessError> for ReplError {
    fn from(e: ValueAccessError) -> Self {
        ReplError::FailedToParse(e.to_string())
    }
}

impl ReplError {
    /// True for the silent cancellation status delivered on shutdown paths.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ReplError::CallbackCanceled)
    }
}

pub type Result<T> = StdResult<T, ReplError>;
