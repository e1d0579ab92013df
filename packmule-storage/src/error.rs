//! Error types shared by all storage backends.

use thiserror::Error;

/// Errors that may occur while selecting, connecting to, or talking to a
/// storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage url cannot be empty")]
    EmptyUrl,

    #[error("storage url '{0}' has no recognizable scheme")]
    MissingScheme(String),

    #[error("no storage driver registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("failed to connect to storage: {0}")]
    Connect(String),

    #[error("file/directory creation error: {0}")]
    FileCreation(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}
