use crate::remote::RemoteError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// How the scheduler and the status model react to a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried after a backoff, never shown to the user
    Transient,
    /// Shown as an error; retries continue at the capped backoff
    Unrecoverable,
    /// Shown as an error; automatic retries stop until configuration changes
    Fatal,
}

/// Failure of a sync cycle, caught at the engine boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("pull timed out after {0:?}")]
    PullTimeout(Duration),

    #[error("push timed out after {0:?}")]
    PushTimeout(Duration),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn class(&self) -> FailureClass {
        match self {
            SyncError::PullTimeout(_) | SyncError::PushTimeout(_) => FailureClass::Transient,
            SyncError::Remote(err) => err.class(),
            SyncError::Store(_) => FailureClass::Unrecoverable,
        }
    }
}
