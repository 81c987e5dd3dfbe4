//! One-call helpers for the common "run this batch with N workers" case.

use crate::batcher::Batcher;
use crate::error::BatcherError;
use crate::handle::ResultHandle;
use crate::streaming::{ResultStream, StreamingBatcher};

use std::future::Future;

/// Runs every generator with at most `worker_count` in flight and returns
/// one handle per generator, in submission order.
pub fn get_all<T, E, I, G, Fut>(generators: I, worker_count: usize) -> Result<Vec<ResultHandle<T, E>>, BatcherError>
where
  T: Send + 'static,
  E: Send + 'static,
  I: IntoIterator<Item = G>,
  G: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = Result<T, E>> + Send + 'static,
{
  let batcher = Batcher::new(worker_count)?;
  Ok(batcher.get_many(generators))
}

/// Runs every generator with at most `worker_count` in flight and returns a
/// stream of outcomes in completion order. The stream ends after the last
/// outcome, or immediately for an empty batch.
pub fn stream_all<T, E, I, G, Fut>(generators: I, worker_count: usize) -> Result<ResultStream<T, E>, BatcherError>
where
  T: Clone + Send + 'static,
  E: Clone + Send + 'static,
  I: IntoIterator<Item = G>,
  G: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = Result<T, E>> + Send + 'static,
{
  let streaming = StreamingBatcher::from_tasks(generators, worker_count, true)?;
  Ok(streaming.results())
}
