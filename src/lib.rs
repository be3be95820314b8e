//! Local-first sync coordinator for the taskflow task app.
//!
//! Every local instance writes to a shared Local Store immediately; one
//! elected leader per storage scope replicates the store with a remote in
//! debounced pull → merge → push cycles.

pub mod broadcast;
pub mod cli;
pub mod clock;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod instance;
pub mod leader;
pub mod remote;
pub mod scheduler;
pub mod status;
pub mod status_file;
pub mod store;
pub mod tracker;

pub use config::SyncConfig;
pub use engine::{CycleKind, CycleOutcome, CycleReport, SyncEngine};
pub use entity::{Checkpoint, EntityId, EntityRecord, Revision};
pub use error::{FailureClass, SyncError};
pub use instance::{InstanceError, Projection, SyncInstance, SyncScope};
pub use leader::{InstanceId, LeaderElection, LeaderToken};
pub use status::{SyncEvent, SyncState, SyncStatus};
pub use store::LocalStore;
