//! Caller-supplied work functions.
//!
//! A [`Processor`] wraps either a plain closure or an async closure behind a
//! single [`invoke`](Processor::invoke) adapter, so the pipeline and batch
//! code never branch on the calling convention. Errors and panics raised by
//! the wrapped function are converted into [`ProcessingError`] values at this
//! boundary.

use crate::error::ProcessingError;
use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Outcome of one processor call
pub type ProcessResult<R> = std::result::Result<R, ProcessingError>;

type SyncCall<T, R> = dyn Fn(T) -> ProcessResult<R> + Send + Sync;
type AsyncCall<T, R> = dyn Fn(T) -> BoxFuture<'static, ProcessResult<R>> + Send + Sync;

/// A function applied to each unit of work
pub enum Processor<T, R> {
    /// Runs to completion on the calling task
    SyncFn(Arc<SyncCall<T, R>>),
    /// Returns a future that is awaited on the calling task
    AsyncFn(Arc<AsyncCall<T, R>>),
}

/// A function applied to a whole batch: `[T] -> [R]`
pub type BatchFn<T, R> = Processor<Vec<T>, Vec<R>>;

impl<T, R> Clone for Processor<T, R> {
    fn clone(&self) -> Self {
        match self {
            Processor::SyncFn(f) => Processor::SyncFn(Arc::clone(f)),
            Processor::AsyncFn(f) => Processor::AsyncFn(Arc::clone(f)),
        }
    }
}

impl<T, R> fmt::Debug for Processor<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Processor::SyncFn(_) => f.write_str("Processor::SyncFn"),
            Processor::AsyncFn(_) => f.write_str("Processor::AsyncFn"),
        }
    }
}

impl<T, R> Processor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Wrap a fallible synchronous function.
    pub fn from_fn<F, E>(f: F) -> Self
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Processor::SyncFn(Arc::new(move |input| f(input).map_err(ProcessingError::failed)))
    }

    /// Wrap a synchronous function that cannot fail.
    pub fn infallible<F>(f: F) -> Self
    where
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        Processor::SyncFn(Arc::new(move |input| Ok(f(input))))
    }

    /// Wrap a fallible async function.
    pub fn from_async<F, Fut, E>(f: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        Processor::AsyncFn(Arc::new(move |input| {
            f(input).map_err(ProcessingError::failed).boxed()
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Processor::AsyncFn(_))
    }

    /// Apply the function, turning errors and panics into `ProcessingError`.
    pub async fn invoke(&self, input: T) -> ProcessResult<R> {
        match self {
            Processor::SyncFn(f) => {
                catch_unwind(AssertUnwindSafe(|| f(input))).unwrap_or_else(|panic| {
                    Err(ProcessingError::from_panic(panic))
                })
            }
            Processor::AsyncFn(f) => AssertUnwindSafe(async { f(input).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ProcessingError::from_panic(panic))),
        }
    }

    /// Apply the function from a plain OS thread.
    ///
    /// Async functions are driven on `handle`, which must belong to a runtime
    /// the current thread is not a worker of.
    pub fn invoke_blocking(&self, input: T, handle: &tokio::runtime::Handle) -> ProcessResult<R> {
        match self {
            Processor::SyncFn(f) => catch_unwind(AssertUnwindSafe(|| f(input)))
                .unwrap_or_else(|panic| Err(ProcessingError::from_panic(panic))),
            Processor::AsyncFn(_) => handle.block_on(self.invoke(input)),
        }
    }
}
