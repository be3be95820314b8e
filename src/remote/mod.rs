//! Remote replication endpoint.
//!
//! The remote is an external, uncontrolled replica that offers two calls:
//! `pull(since)` returning changes after a checkpoint, and `push(docs)`
//! returning which documents it accepted or rejected.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{MemoryRemote, RemoteCall, RemoteOp};

use crate::entity::{Checkpoint, EntityId, EntityRecord};
use crate::error::FailureClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One page of remote changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    pub changes: Vec<EntityRecord>,
    /// Cursor to resume from after applying `changes`
    pub checkpoint: Checkpoint,
    /// More changes are available after `checkpoint`
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub id: EntityId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    #[serde(default)]
    pub accepted: Vec<EntityId>,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,
    #[error("remote temporarily unavailable{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Unavailable { status: Option<u16>, message: String },
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote rejected credentials: {0}")]
    Unauthorized(String),
    #[error("incompatible remote schema: {0}")]
    IncompatibleSchema(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("unexpected remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Timeout | RemoteError::Unavailable { .. } => FailureClass::Transient,
            RemoteError::Unreachable(_)
            | RemoteError::PayloadTooLarge
            | RemoteError::Protocol(_) => FailureClass::Unrecoverable,
            RemoteError::Unauthorized(_) | RemoteError::IncompatibleSchema(_) => {
                FailureClass::Fatal
            }
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Changes made on the remote after `since`.
    async fn pull(&self, since: Checkpoint) -> Result<PullBatch, RemoteError>;

    /// Submit local records. Every id should come back either accepted or
    /// rejected; ids missing from the ack are treated as not delivered.
    async fn push(&self, records: Vec<EntityRecord>) -> Result<PushAck, RemoteError>;
}
