use crate::error::TaskError;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures::future::BoxFuture;
use futures::FutureExt;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// The boxed future a generator may produce.
/// It must be `Send` and `'static`, and resolve to `Result<T, E>`.
pub type TaskFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// A type-erased, deferred unit of work. Nothing runs until a worker calls it.
///
/// Any `FnOnce() -> impl Future<Output = Result<T, E>>` closure can be submitted
/// directly; this alias is for callers that need to mix differently-typed
/// closures in one collection.
pub type TaskGenerator<T, E> = Box<dyn FnOnce() -> TaskFuture<T, E> + Send + 'static>;

/// Outcome of a single task as seen by handles and stream subscribers.
pub type TaskOutcome<T, E> = Result<T, TaskError<E>>;

/// Untyped job stored in the worker pool's queue. The typed wrapping
/// (result handle, stream publication) is baked in at submission time.
pub(crate) type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Internal representation of a queued job.
pub(crate) struct QueueItem {
  pub(crate) task_id: u64,
  pub(crate) job: Job,
}

pub(crate) fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Invokes a generator and awaits its future, turning a panic at either point
/// into `TaskError::Panicked` so it can never unwind into a worker.
pub(crate) async fn run_guarded<G, Fut, T, E>(generator: G) -> TaskOutcome<T, E>
where
  G: FnOnce() -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let future = match std::panic::catch_unwind(AssertUnwindSafe(generator)) {
    Ok(future) => future,
    Err(_panic_payload) => return Err(TaskError::Panicked),
  };

  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(Ok(value)) => Ok(value),
    Ok(Err(e)) => Err(TaskError::Failed(e)),
    Err(_panic_payload) => Err(TaskError::Panicked),
  }
}
