use crate::config::BatcherConfig;
use crate::error::BatcherError;
use crate::handle::ResultHandle;
use crate::task::{next_task_id, run_guarded, QueueItem};
use crate::worker_pool::WorkerPool;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Runs deferred futures with at most `worker_count` of them in flight.
///
/// Generators are queued in FIFO order and invoked only when a worker picks
/// them up. The worker count can be changed at any time: growing it spawns
/// workers right away, shrinking it lets surplus workers retire once their
/// current task finishes. In-flight tasks are never interrupted.
///
/// Cloning a `Batcher` yields another handle to the same queue and workers.
pub struct Batcher<T, E> {
  pool: WorkerPool,
  _outcome: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for Batcher<T, E> {
  fn clone(&self) -> Self {
    Self {
      pool: self.pool.clone(),
      _outcome: PhantomData,
    }
  }
}

impl<T, E> fmt::Debug for Batcher<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Batcher").field("pool", &self.pool).finish()
  }
}

impl<T, E> Batcher<T, E>
where
  T: Send + 'static,
  E: Send + 'static,
{
  /// Creates a batcher on the current Tokio runtime.
  ///
  /// # Errors
  /// `BatcherError::InvalidWorkerCount` if `worker_count < 1`,
  /// `BatcherError::NoRuntime` if called outside a Tokio runtime.
  pub fn new(worker_count: usize) -> Result<Self, BatcherError> {
    Self::with_config(BatcherConfig::new(worker_count))
  }

  pub fn with_config(config: BatcherConfig) -> Result<Self, BatcherError> {
    let resolved = config.resolve()?;
    Ok(Self {
      pool: WorkerPool::new(resolved),
      _outcome: PhantomData,
    })
  }

  pub fn name(&self) -> &str {
    self.pool.name()
  }

  /// The current target number of concurrent workers.
  pub fn worker_count(&self) -> usize {
    self.pool.worker_count()
  }

  /// Changes the concurrency limit.
  ///
  /// # Errors
  /// `BatcherError::InvalidWorkerCount` if `worker_count < 1`; the previous
  /// limit stays in effect.
  pub fn set_worker_count(&self, worker_count: usize) -> Result<(), BatcherError> {
    self.pool.set_worker_count(worker_count)
  }

  /// Queues a generator whose outcome is discarded.
  ///
  /// Failures and panics of fire-and-forget tasks are intentionally not
  /// reported anywhere except a debug-level log line. Use `get_one` when the
  /// outcome matters.
  pub fn add_one<G, Fut>(&self, generator: G)
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.pool.enqueue(vec![self.fire_and_forget_item(generator)]);
  }

  /// Queues several generators whose outcomes are discarded. See `add_one`.
  pub fn add_many<I, G, Fut>(&self, generators: I)
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let items: Vec<QueueItem> = generators
      .into_iter()
      .map(|generator| self.fire_and_forget_item(generator))
      .collect();
    self.pool.enqueue(items);
  }

  /// Queues a generator and returns a handle resolving to its outcome.
  /// Returns immediately; nothing is awaited here.
  pub fn get_one<G, Fut>(&self, generator: G) -> ResultHandle<T, E>
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (item, handle) = self.handled_item(generator);
    self.pool.enqueue(vec![item]);
    handle
  }

  /// Queues several generators, returning one handle per generator in
  /// submission order.
  pub fn get_many<I, G, Fut>(&self, generators: I) -> Vec<ResultHandle<T, E>>
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (items, handles): (Vec<QueueItem>, Vec<ResultHandle<T, E>>) = generators
      .into_iter()
      .map(|generator| self.handled_item(generator))
      .unzip();
    self.pool.enqueue(items);
    handles
  }

  /// Number of tasks waiting for a worker.
  pub fn queue_length(&self) -> usize {
    self.pool.queue_length()
  }

  pub fn is_queue_empty(&self) -> bool {
    self.pool.is_queue_empty()
  }

  /// `true` when no worker is running.
  pub fn is_idle(&self) -> bool {
    self.pool.is_idle()
  }

  /// Number of live workers, including surplus ones still finishing a task
  /// after the worker count was lowered.
  pub fn running_worker_count(&self) -> usize {
    self.pool.running_worker_count()
  }

  /// Number of tasks currently executing.
  pub fn active_task_count(&self) -> usize {
    self.pool.active_task_count()
  }

  /// Queues a pre-built item. Used by `StreamingBatcher`, which bakes its own
  /// publication step into the job.
  pub(crate) fn enqueue_items(&self, items: Vec<QueueItem>) {
    self.pool.enqueue(items);
  }

  fn fire_and_forget_item<G, Fut>(&self, generator: G) -> QueueItem
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let task_id = next_task_id();
    let batcher_name = self.pool.name().to_string();
    QueueItem {
      task_id,
      job: Box::new(move || {
        async move {
          if run_guarded(generator).await.is_err() {
            debug!(batcher = %batcher_name, %task_id, "Fire-and-forget task failed. Outcome discarded.");
          }
        }
        .boxed()
      }),
    }
  }

  fn handled_item<G, Fut>(&self, generator: G) -> (QueueItem, ResultHandle<T, E>)
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let task_id = next_task_id();
    let (result_tx, result_rx) = oneshot::channel();
    let batcher_name = self.pool.name().to_string();
    let item = QueueItem {
      task_id,
      job: Box::new(move || {
        async move {
          let outcome = run_guarded(generator).await;
          if result_tx.send(outcome).is_err() {
            warn!(
              batcher = %batcher_name,
              %task_id,
              "Result receiver for task was dropped. Task outcome may have been lost."
            );
          }
        }
        .boxed()
      }),
    };
    (item, ResultHandle::new(task_id, result_rx))
  }
}
