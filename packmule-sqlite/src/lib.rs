//! SQLite storage backend for the packmule job queue.
//!
//! This is the reference implementation of the
//! [`Storage`](packmule_storage::Storage) contract, built on `sqlx`. SQLite
//! has no native find-and-modify, so the atomic claim is a guarded update
//! (`WHERE id = ? AND modified = ?`) that reselects when the guard misses,
//! and TTL eviction is a background sweeper task rather than a store-side
//! index.
//!
//! Connect through the driver:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use packmule_storage::{StorageOptions, StorageRegistry};
//! use packmule_sqlite::SqliteDriver;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = StorageRegistry::new();
//!     registry.register(Arc::new(SqliteDriver::new()));
//!     let store = registry
//!         .open("sqlite://queue.db", &StorageOptions::default())
//!         .await
//!         .unwrap();
//!     drop(store);
//! }
//! ```

mod driver;
mod schema;
mod store;

pub use driver::SqliteDriver;
pub use store::SqliteStorage;
