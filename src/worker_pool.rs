use crate::config::ResolvedConfig;
use crate::error::BatcherError;
use crate::task::QueueItem;

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// FIFO queue of jobs plus the bookkeeping for the workers draining it.
///
/// Every field is guarded by the single pool lock. Workers are ordered by
/// spawn sequence, so a worker's index in `running_workers` is its rank.
pub(crate) struct PoolState {
  desired_worker_count: usize,
  queue: VecDeque<QueueItem>,
  running_workers: Vec<u64>,
  busy_workers: usize,
  next_worker_seq: u64,
}

/// What a worker does next, decided atomically with respect to enqueues.
pub(crate) enum WorkerStep {
  Run(QueueItem),
  /// The pool is above its target and this worker ranks among the surplus.
  Retire,
  /// Nothing left to claim.
  Drained,
}

impl PoolState {
  pub(crate) fn new(desired_worker_count: usize) -> Self {
    Self {
      desired_worker_count,
      queue: VecDeque::new(),
      running_workers: Vec::new(),
      busy_workers: 0,
      next_worker_seq: 0,
    }
  }

  /// Registers as many new workers as needed to reach
  /// `min(desired, busy + queued)` and returns their sequence numbers.
  /// Workers that are between items are already counted as running and will
  /// claim queued items themselves.
  pub(crate) fn plan_spawns(&mut self) -> Vec<u64> {
    let required = self
      .desired_worker_count
      .min(self.busy_workers + self.queue.len());
    let missing = required.saturating_sub(self.running_workers.len());
    (0..missing)
      .map(|_| {
        let seq = self.next_worker_seq;
        self.next_worker_seq += 1;
        self.running_workers.push(seq);
        seq
      })
      .collect()
  }

  /// Called by a worker at every loop boundary. A worker that gets back
  /// `Retire` or `Drained` has already been deregistered.
  pub(crate) fn next_step(&mut self, worker_seq: u64, finished_item: bool) -> WorkerStep {
    if finished_item {
      self.busy_workers = self.busy_workers.saturating_sub(1);
    }

    let rank = match self.running_workers.iter().position(|seq| *seq == worker_seq) {
      Some(rank) => rank,
      None => return WorkerStep::Drained,
    };

    if rank >= self.desired_worker_count {
      self.running_workers.remove(rank);
      return WorkerStep::Retire;
    }

    match self.queue.pop_front() {
      Some(item) => {
        self.busy_workers += 1;
        WorkerStep::Run(item)
      }
      None => {
        self.running_workers.remove(rank);
        WorkerStep::Drained
      }
    }
  }

  fn deregister(&mut self, worker_seq: u64, busy: bool) {
    if busy {
      self.busy_workers = self.busy_workers.saturating_sub(1);
    }
    self.running_workers.retain(|seq| *seq != worker_seq);
  }
}

struct PoolShared {
  name: Arc<str>,
  runtime: TokioHandle,
  state: Mutex<PoolState>,
}

/// Untyped worker pool backing both batcher flavours.
///
/// Cloning is cheap and every clone drives the same queue. Queued jobs keep
/// draining after the last clone is dropped since workers hold their own
/// reference to the shared state.
#[derive(Clone)]
pub(crate) struct WorkerPool {
  shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("WorkerPool")
      .field("name", &self.shared.name)
      .field("worker_count", &state.desired_worker_count)
      .field("running_workers", &state.running_workers.len())
      .field("queue_length", &state.queue.len())
      .finish_non_exhaustive()
  }
}

impl WorkerPool {
  pub(crate) fn new(config: ResolvedConfig) -> Self {
    info!(batcher = %config.name, worker_count = config.worker_count, "Worker pool created.");
    Self {
      shared: Arc::new(PoolShared {
        name: Arc::from(config.name),
        runtime: config.runtime,
        state: Mutex::new(PoolState::new(config.worker_count)),
      }),
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.shared.name
  }

  pub(crate) fn worker_count(&self) -> usize {
    self.shared.state.lock().desired_worker_count
  }

  pub(crate) fn set_worker_count(&self, worker_count: usize) -> Result<(), BatcherError> {
    if worker_count < 1 {
      warn!(batcher = %self.shared.name, worker_count, "Rejected worker count below 1.");
      return Err(BatcherError::InvalidWorkerCount(worker_count));
    }

    let (previous, spawns) = {
      let mut state = self.shared.state.lock();
      let previous = state.desired_worker_count;
      if previous == worker_count {
        return Ok(());
      }
      state.desired_worker_count = worker_count;
      let spawns = if worker_count > previous {
        state.plan_spawns()
      } else {
        Vec::new()
      };
      (previous, spawns)
    };

    info!(
      batcher = %self.shared.name,
      previous,
      worker_count,
      spawning = spawns.len(),
      "Worker count changed."
    );
    self.spawn_workers(spawns);
    Ok(())
  }

  /// Appends items to the back of the queue and spawns workers up to target.
  pub(crate) fn enqueue(&self, items: Vec<QueueItem>) {
    if items.is_empty() {
      return;
    }
    let submitted = items.len();

    let (queue_length, spawns) = {
      let mut state = self.shared.state.lock();
      state.queue.extend(items);
      let spawns = state.plan_spawns();
      (state.queue.len(), spawns)
    };

    debug!(
      batcher = %self.shared.name,
      submitted,
      queue_length,
      spawning = spawns.len(),
      "Enqueued tasks."
    );
    self.spawn_workers(spawns);
  }

  pub(crate) fn queue_length(&self) -> usize {
    self.shared.state.lock().queue.len()
  }

  pub(crate) fn is_queue_empty(&self) -> bool {
    self.shared.state.lock().queue.is_empty()
  }

  pub(crate) fn running_worker_count(&self) -> usize {
    self.shared.state.lock().running_workers.len()
  }

  pub(crate) fn active_task_count(&self) -> usize {
    self.shared.state.lock().busy_workers
  }

  pub(crate) fn is_idle(&self) -> bool {
    self.shared.state.lock().running_workers.is_empty()
  }

  fn spawn_workers(&self, worker_seqs: Vec<u64>) {
    for worker_seq in worker_seqs {
      let shared = self.shared.clone();
      let span = info_span!("batcher_worker", batcher = %self.shared.name, worker = worker_seq);
      self
        .shared
        .runtime
        .spawn(Self::run_worker(shared, worker_seq).instrument(span));
    }
  }

  async fn run_worker(shared: Arc<PoolShared>, worker_seq: u64) {
    debug!(batcher = %shared.name, worker = worker_seq, "Worker started.");
    let mut registration = WorkerRegistration {
      shared: shared.clone(),
      worker_seq,
      registered: true,
      busy: false,
    };

    loop {
      let step = shared.state.lock().next_step(worker_seq, registration.busy);

      let item = match step {
        WorkerStep::Run(item) => {
          registration.busy = true;
          item
        }
        WorkerStep::Retire => {
          registration.release();
          debug!(batcher = %shared.name, worker = worker_seq, "Pool above target worker count. Worker retiring.");
          break;
        }
        WorkerStep::Drained => {
          registration.release();
          debug!(batcher = %shared.name, worker = worker_seq, "Queue drained. Worker exiting.");
          break;
        }
      };

      let task_id = item.task_id;
      trace!(batcher = %shared.name, worker = worker_seq, %task_id, "Dequeued task.");

      let job = item.job;
      // Typed wrappers already isolate generator panics; this keeps the loop
      // alive even if a wrapper itself unwinds.
      if AssertUnwindSafe(async move { job().await })
        .catch_unwind()
        .await
        .is_err()
      {
        error!(batcher = %shared.name, worker = worker_seq, %task_id, "Task wrapper panicked.");
      } else {
        trace!(batcher = %shared.name, worker = worker_seq, %task_id, "Task finished.");
      }
    }
  }
}

/// Deregisters a worker whose future is dropped mid-flight (e.g. its runtime
/// shut down) so the pool does not count it as running forever.
struct WorkerRegistration {
  shared: Arc<PoolShared>,
  worker_seq: u64,
  registered: bool,
  busy: bool,
}

impl WorkerRegistration {
  /// Marks the worker as already deregistered by `next_step`.
  fn release(&mut self) {
    self.registered = false;
    self.busy = false;
  }
}

impl Drop for WorkerRegistration {
  fn drop(&mut self) {
    if self.registered {
      self.shared.state.lock().deregister(self.worker_seq, self.busy);
      trace!(batcher = %self.shared.name, worker = self.worker_seq, "Dropped worker deregistered.");
    }
  }
}
