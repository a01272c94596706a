//! Reconciliation of local status changes with a remote zone backend:
//! collaborator traits, the cancel/suspend operation pipeline, and the
//! engine orchestrating the refresh protocol.

mod engine;
mod pipeline;
mod remote;

pub use engine::{SyncContext, SyncEngine};
pub use pipeline::{Pipeline, PipelineControls, PipelineHandle};
pub use remote::{ChangeToken, FeedRef, FeedSource, RemoteBackend, StatusUpdate, ZoneDelta};

use crate::storage::StoreError;

/// Errors surfaced by sync operations. A pipeline reports the first failing
/// step's error and nothing after it.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The remote backend rejected or failed an operation
    #[error("remote backend error: {0}")]
    Backend(String),

    /// The operation was canceled before completion. Completed steps are
    /// not rolled back.
    #[error("sync operation canceled")]
    Canceled,
}
