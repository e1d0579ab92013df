//! Persistent data model and storage contract for the packmule job queue.
//!
//! Jobs live in a shared backing store; any number of producer processes
//! insert them and any number of worker processes lease and execute them.
//! This crate defines the shapes that cross the storage boundary and the
//! behavioral contract every backend must satisfy:
//!
//! - [`JobRecord`] - The persisted job entity and its lifecycle fields
//! - [`Storage`] - The operations a backend implements, including the
//!   atomic poll-and-claim
//! - [`StorageDriver`] / [`StorageRegistry`] - Backend selection keyed by
//!   the scheme of a storage URL
//! - [`JobPatch`] - Partial updates applied under the lease discipline
//!
//! Backends are replaceable; the queue engine depends only on the traits
//! defined here.

mod contract;
mod error;
mod options;
mod patch;
mod registry;
mod types;

pub use contract::Storage;
pub use error::StorageError;
pub use options::StorageOptions;
pub use patch::JobPatch;
pub use registry::{scheme_of, StorageDriver, StorageRegistry};
pub use types::{
    JobLogEntry, JobRecord, JobResultRecord, JobSelector, JobStatus, Lease, LogLevel, Stopwatches,
};

// Re-export async_trait for convenience when implementing Storage backends.
pub use async_trait::async_trait;
