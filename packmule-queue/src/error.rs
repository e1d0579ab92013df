//! Engine error taxonomy.

use thiserror::Error;

use packmule_storage::StorageError;

/// Errors surfaced by the queue engine.
///
/// Handler failures are not represented here: they mark the job `error`
/// (re-claimable while retries remain) and surface on the
/// [`HandlerError`](crate::QueueEvent::HandlerError) event. A duplicate
/// `unique_id` on push is the `false` return of `push`, not an error.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("handler already registered for job type '{0}'")]
    HandlerExists(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("lease no longer current")]
    LeaseLost,

    #[error("invalid job state: {0}")]
    State(String),
}
