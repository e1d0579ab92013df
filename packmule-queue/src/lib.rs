//! Distributed, persistent job queue.
//!
//! Any number of client processes push jobs into a shared backing store; any
//! number of worker processes poll the store, lease runnable jobs under a
//! lock, execute a registered handler per job type, and record the outcome.
//! Delivery is at-least-once: an expired lease makes a job reclaimable, and
//! results returned after a lease is lost are discarded.
//!
//! # Architecture
//!
//! - [`JobQueue`] - The engine: polling loop, handler registry, per-type
//!   concurrency, lease supervision, cooperative cancellation
//! - [`JobHandler`] - Trait implemented per job type
//! - [`Job`] - A leased job as seen by its handler
//! - [`QueueEvent`] - Observable engine events via a broadcast channel
//!
//! # Example
//!
//! ```rust,no_run
//! use packmule_queue::{async_trait, CancellationToken, HandlerOpts, Job, JobHandler,
//!                      JobOptions, JobQueue, QueueConfig};
//! use serde_json::{json, Value};
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl JobHandler for Greeter {
//!     async fn run(
//!         &self,
//!         job: Job,
//!         _cancel: CancellationToken,
//!     ) -> Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(Some(json!(format!("hello {}", job.snapshot().message))))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue = JobQueue::connect("sqlite://queue.db", QueueConfig::default())
//!         .await
//!         .unwrap();
//!     queue.handle("greet", HandlerOpts::default(), Greeter).unwrap();
//!     queue.push("greet", json!("world"), JobOptions::default()).await.unwrap();
//!     queue.start();
//! }
//! ```

mod config;
mod error;
mod events;
mod handler;
mod job;
mod options;
mod queue;
mod recurrence;
mod worker;

pub use config::QueueConfig;
pub use error::QueueError;
pub use events::QueueEvent;
pub use handler::{handler_fn, FnHandler, HandlerOpts, HandlerResult, JobHandler};
pub use job::Job;
pub use options::JobOptions;
pub use queue::{default_registry, JobQueue, Pusher};
pub use recurrence::next_occurrence;

pub use packmule_storage::{
    JobLogEntry, JobRecord, JobResultRecord, JobSelector, JobStatus, LogLevel, Storage,
    StorageError, StorageOptions, StorageRegistry, Stopwatches,
};

// Re-exports for handler implementations.
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
