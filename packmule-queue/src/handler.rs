//! Handler registration surface.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// What a handler returns: an optional result payload, stored for
/// non-recurring completions, or an error that marks the job `error`.
pub type HandlerResult = Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Executes jobs of one type.
///
/// The cancellation token is the cooperative-cancel surface: it fires when
/// the job's lease passes its timeout, when the job is canceled through the
/// api, or when the engine stops. Handlers that ignore it run to completion,
/// but a result returned after the lease died is discarded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job, cancel: CancellationToken) -> HandlerResult;
}

/// Per-type execution limits.
#[derive(Debug, Clone, Copy)]
pub struct HandlerOpts {
    /// Jobs of this type allowed in flight at once in this process.
    pub concurrency: usize,
}

impl Default for HandlerOpts {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl HandlerOpts {
    pub fn concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

/// Adapts a closure into a [`JobHandler`].
///
/// The closure must return a boxed future:
///
/// ```rust,ignore
/// queue.handle("noop", HandlerOpts::default(), handler_fn(|_job, _cancel| {
///     Box::pin(async { Ok(None) })
/// }))?;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Job, CancellationToken) -> BoxFuture<HandlerResult> + Send + Sync,
{
    FnHandler { f }
}

/// See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(Job, CancellationToken) -> BoxFuture<HandlerResult> + Send + Sync,
{
    async fn run(&self, job: Job, cancel: CancellationToken) -> HandlerResult {
        (self.f)(job, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_is_one() {
        assert_eq!(HandlerOpts::default().concurrency, 1);
        assert_eq!(HandlerOpts::concurrency(0).concurrency, 1);
        assert_eq!(HandlerOpts::concurrency(4).concurrency, 4);
    }
}
