use crate::batcher::Batcher;
use crate::config::BatcherConfig;
use crate::error::{BatcherError, TaskError};
use crate::handle::ResultHandle;
use crate::task::{next_task_id, run_guarded, QueueItem, TaskOutcome};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

/// A resolved task as seen by result stream subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent<T, E> {
  Completed { task_id: u64, value: T },
  Failed { task_id: u64, error: TaskError<E> },
}

impl<T, E> TaskEvent<T, E> {
  pub fn task_id(&self) -> u64 {
    match self {
      TaskEvent::Completed { task_id, .. } | TaskEvent::Failed { task_id, .. } => *task_id,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, TaskEvent::Completed { .. })
  }

  pub fn into_result(self) -> TaskOutcome<T, E> {
    match self {
      TaskEvent::Completed { value, .. } => Ok(value),
      TaskEvent::Failed { error, .. } => Err(error),
    }
  }
}

impl<T: Clone, E: Clone> TaskEvent<T, E> {
  fn from_outcome(task_id: u64, outcome: &TaskOutcome<T, E>) -> Self {
    match outcome {
      Ok(value) => TaskEvent::Completed {
        task_id,
        value: value.clone(),
      },
      Err(error) => TaskEvent::Failed {
        task_id,
        error: error.clone(),
      },
    }
  }
}

/// One subscription to a `StreamingBatcher`'s merged results.
///
/// Yields successes and failures in completion order and ends once the
/// batcher's result channel is closed and every buffered event is consumed.
#[derive(Debug)]
pub struct ResultStream<T, E> {
  /// Completed replay of an initial batch, drained before `receiver`.
  backlog: Option<mpsc::UnboundedReceiver<TaskEvent<T, E>>>,
  receiver: mpsc::UnboundedReceiver<TaskEvent<T, E>>,
}

impl<T, E> ResultStream<T, E> {
  fn live(receiver: mpsc::UnboundedReceiver<TaskEvent<T, E>>) -> Self {
    Self {
      backlog: None,
      receiver,
    }
  }

  fn closed() -> Self {
    let (_tx, receiver) = mpsc::unbounded_channel();
    Self::live(receiver)
  }

  /// Receives the next event, or `None` once the stream has ended.
  pub async fn next_event(&mut self) -> Option<TaskEvent<T, E>> {
    futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
  }
}

impl<T, E> Stream for ResultStream<T, E> {
  type Item = TaskEvent<T, E>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    if let Some(backlog) = this.backlog.as_mut() {
      // The backlog's sender is gone, so it never stays pending.
      match backlog.poll_recv(cx) {
        Poll::Ready(Some(event)) => return Poll::Ready(Some(event)),
        Poll::Ready(None) => this.backlog = None,
        Poll::Pending => return Poll::Pending,
      }
    }
    this.receiver.poll_recv(cx)
  }
}

/// Buffer for the batch handed to `from_tasks`, kept until `results` claims
/// it. Only that batch's outcomes are buffered, and the sender is released
/// once all of them are in, so an unclaimed replay never grows further.
struct InitialReplay<T, E> {
  tx: Option<mpsc::UnboundedSender<TaskEvent<T, E>>>,
  receiver: mpsc::UnboundedReceiver<TaskEvent<T, E>>,
  remaining: u64,
}

struct StreamState<T, E> {
  subscribers: Vec<mpsc::UnboundedSender<TaskEvent<T, E>>>,
  initial_replay: Option<InitialReplay<T, E>>,
  total_submitted: u64,
  resolved_count: u64,
  close_when_idle: bool,
  closed: bool,
}

impl<T: Clone, E: Clone> StreamState<T, E> {
  fn publish(&mut self, event: TaskEvent<T, E>, from_initial_batch: bool) {
    if from_initial_batch {
      if let Some(replay) = self.initial_replay.as_mut() {
        if replay.tx.as_ref().is_some_and(|tx| tx.send(event.clone()).is_err()) {
          replay.tx = None;
        }
        replay.remaining = replay.remaining.saturating_sub(1);
        if replay.remaining == 0 {
          replay.tx = None;
        }
      }
    }
    // Receivers that were dropped are pruned on the way.
    self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
  }

  /// Hands out the initial batch replay followed by live events, or a plain
  /// subscription when there is nothing to replay.
  fn claim_results(&mut self) -> ResultStream<T, E> {
    let replay = match self.initial_replay.take() {
      Some(replay) => replay,
      None => return self.subscribe(),
    };
    match replay.tx {
      // Still collecting the batch: the replay channel simply becomes a
      // regular subscription.
      Some(tx) if !self.closed => {
        self.subscribers.push(tx);
        ResultStream::live(replay.receiver)
      }
      _ => {
        let mut stream = self.subscribe();
        stream.backlog = Some(replay.receiver);
        stream
      }
    }
  }

  fn subscribe(&mut self) -> ResultStream<T, E> {
    if self.closed {
      return ResultStream::closed();
    }
    let (tx, receiver) = mpsc::unbounded_channel();
    self.subscribers.push(tx);
    ResultStream::live(receiver)
  }

  /// Returns `true` only for the call that actually closed the channel.
  fn close(&mut self) -> bool {
    if self.closed {
      return false;
    }
    self.closed = true;
    self.subscribers.clear();
    if let Some(replay) = self.initial_replay.as_mut() {
      replay.tx = None;
    }
    true
  }

  fn is_drained(&self) -> bool {
    self.resolved_count == self.total_submitted
  }
}

struct StreamShared<T, E> {
  name: Arc<str>,
  state: Mutex<StreamState<T, E>>,
}

impl<T: Clone, E: Clone> StreamShared<T, E> {
  /// Publishes an outcome and applies the idle-close rule in one critical
  /// section, so a concurrent submission is either counted before the
  /// comparison or rejected after the close.
  fn record_outcome(&self, task_id: u64, outcome: &TaskOutcome<T, E>, from_initial_batch: bool) {
    let event = TaskEvent::from_outcome(task_id, outcome);
    let (resolved_count, closed_now) = {
      let mut state = self.state.lock();
      state.publish(event, from_initial_batch);
      state.resolved_count += 1;
      let closed_now = state.close_when_idle && state.is_drained() && state.close();
      (state.resolved_count, closed_now)
    };

    trace!(stream = %self.name, %task_id, resolved_count, "Published task outcome.");
    if closed_now {
      info!(stream = %self.name, resolved_count, "All submitted tasks resolved. Result stream closed.");
    }
  }
}

/// A `Batcher` that also publishes every outcome to a merged,
/// multi-subscriber result stream.
///
/// With `close_when_idle` enabled, the stream closes as soon as every task
/// submitted so far has resolved. Once closed, new submissions are rejected
/// with `BatcherError::StreamClosed`.
pub struct StreamingBatcher<T, E> {
  batcher: Batcher<T, E>,
  shared: Arc<StreamShared<T, E>>,
}

impl<T, E> Clone for StreamingBatcher<T, E> {
  fn clone(&self) -> Self {
    Self {
      batcher: self.batcher.clone(),
      shared: self.shared.clone(),
    }
  }
}

impl<T, E> fmt::Debug for StreamingBatcher<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state.lock();
    f.debug_struct("StreamingBatcher")
      .field("batcher", &self.batcher)
      .field("total_submitted", &state.total_submitted)
      .field("resolved_count", &state.resolved_count)
      .field("close_when_idle", &state.close_when_idle)
      .field("closed", &state.closed)
      .finish_non_exhaustive()
  }
}

impl<T, E> StreamingBatcher<T, E>
where
  T: Clone + Send + 'static,
  E: Clone + Send + 'static,
{
  /// Creates an empty streaming batcher that stays open until `close` is
  /// called or `close_when_idle` is enabled.
  pub fn new(worker_count: usize) -> Result<Self, BatcherError> {
    Self::with_config(BatcherConfig::new(worker_count))
  }

  pub fn with_config(config: BatcherConfig) -> Result<Self, BatcherError> {
    let batcher = Batcher::with_config(config)?;
    let shared = Arc::new(StreamShared {
      name: Arc::from(batcher.name()),
      state: Mutex::new(StreamState {
        subscribers: Vec::new(),
        initial_replay: None,
        total_submitted: 0,
        resolved_count: 0,
        close_when_idle: false,
        closed: false,
      }),
    });
    Ok(Self { batcher, shared })
  }

  /// Creates a streaming batcher and submits an initial batch.
  ///
  /// With `close_when_idle`, the stream closes once the whole batch has
  /// resolved, or immediately when the batch is empty.
  pub fn from_tasks<I, G, Fut>(generators: I, worker_count: usize, close_when_idle: bool) -> Result<Self, BatcherError>
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    Self::from_tasks_with_config(generators, BatcherConfig::new(worker_count), close_when_idle)
  }

  pub fn from_tasks_with_config<I, G, Fut>(
    generators: I,
    config: BatcherConfig,
    close_when_idle: bool,
  ) -> Result<Self, BatcherError>
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let streaming = Self::with_config(config)?;
    let generators: Vec<G> = generators.into_iter().collect();
    {
      let (tx, receiver) = mpsc::unbounded_channel();
      let remaining = generators.len() as u64;
      streaming.shared.state.lock().initial_replay = Some(InitialReplay {
        tx: (remaining > 0).then_some(tx),
        receiver,
        remaining,
      });
    }
    streaming.submit_many(generators, true)?;
    // Applied after submission so an early finisher cannot close the stream
    // while the rest of the batch is still being queued.
    streaming.set_close_when_idle(close_when_idle);
    Ok(streaming)
  }

  pub fn name(&self) -> &str {
    self.batcher.name()
  }

  pub fn worker_count(&self) -> usize {
    self.batcher.worker_count()
  }

  pub fn set_worker_count(&self, worker_count: usize) -> Result<(), BatcherError> {
    self.batcher.set_worker_count(worker_count)
  }

  /// Queues a generator. Its outcome only reaches stream subscribers.
  pub fn add_one<G, Fut>(&self, generator: G) -> Result<(), BatcherError>
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.register_submissions(1)?;
    self.batcher.enqueue_items(vec![self.streaming_item(generator, None, false)]);
    Ok(())
  }

  pub fn add_many<I, G, Fut>(&self, generators: I) -> Result<(), BatcherError>
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.submit_many(generators.into_iter().collect(), false)
  }

  /// Queues a generator whose outcome goes both to the returned handle and
  /// to stream subscribers.
  pub fn get_one<G, Fut>(&self, generator: G) -> Result<ResultHandle<T, E>, BatcherError>
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.register_submissions(1)?;
    let (item, handle) = self.handled_streaming_item(generator);
    self.batcher.enqueue_items(vec![item]);
    Ok(handle)
  }

  pub fn get_many<I, G, Fut>(&self, generators: I) -> Result<Vec<ResultHandle<T, E>>, BatcherError>
  where
    I: IntoIterator<Item = G>,
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let generators: Vec<G> = generators.into_iter().collect();
    self.register_submissions(generators.len())?;
    let (items, handles): (Vec<QueueItem>, Vec<ResultHandle<T, E>>) = generators
      .into_iter()
      .map(|generator| self.handled_streaming_item(generator))
      .unzip();
    self.batcher.enqueue_items(items);
    Ok(handles)
  }

  /// For a batcher built with `from_tasks`, the first call returns a stream
  /// that replays every outcome of the initial batch and then continues with
  /// live events. Otherwise (and on later calls) this is `subscribe`.
  pub fn results(&self) -> ResultStream<T, E> {
    self.shared.state.lock().claim_results()
  }

  /// Opens a new subscription receiving events published from now on.
  /// After the channel is closed this returns an already-ended stream.
  pub fn subscribe(&self) -> ResultStream<T, E> {
    self.shared.state.lock().subscribe()
  }

  pub fn close_when_idle(&self) -> bool {
    self.shared.state.lock().close_when_idle
  }

  /// Enabling this while every submitted task has already resolved closes
  /// the stream immediately; otherwise it takes effect on the next drain.
  pub fn set_close_when_idle(&self, close_when_idle: bool) {
    let closed_now = {
      let mut state = self.shared.state.lock();
      state.close_when_idle = close_when_idle;
      close_when_idle && state.is_drained() && state.close()
    };
    debug!(stream = %self.shared.name, close_when_idle, "Close-when-idle updated.");
    if closed_now {
      info!(stream = %self.shared.name, "Stream already drained. Result stream closed.");
    }
  }

  /// Closes the result stream. Subscribers still receive events buffered
  /// before the close. Calling this more than once is harmless.
  pub fn close(&self) {
    if self.shared.state.lock().close() {
      info!(stream = %self.shared.name, "Result stream closed.");
    } else {
      trace!(stream = %self.shared.name, "Close requested on an already closed result stream.");
    }
  }

  pub fn is_closed(&self) -> bool {
    self.shared.state.lock().closed
  }

  pub fn total_submitted(&self) -> u64 {
    self.shared.state.lock().total_submitted
  }

  pub fn resolved_count(&self) -> u64 {
    self.shared.state.lock().resolved_count
  }

  /// Number of live subscriptions, including an unclaimed initial batch
  /// replay that is still collecting outcomes.
  pub fn subscriber_count(&self) -> usize {
    let state = self.shared.state.lock();
    let replaying = state
      .initial_replay
      .as_ref()
      .map_or(0, |replay| usize::from(replay.tx.is_some()));
    state.subscribers.len() + replaying
  }

  pub fn queue_length(&self) -> usize {
    self.batcher.queue_length()
  }

  pub fn is_queue_empty(&self) -> bool {
    self.batcher.is_queue_empty()
  }

  pub fn is_idle(&self) -> bool {
    self.batcher.is_idle()
  }

  pub fn running_worker_count(&self) -> usize {
    self.batcher.running_worker_count()
  }

  pub fn active_task_count(&self) -> usize {
    self.batcher.active_task_count()
  }

  fn submit_many<G, Fut>(&self, generators: Vec<G>, from_initial_batch: bool) -> Result<(), BatcherError>
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    self.register_submissions(generators.len())?;
    let items = generators
      .into_iter()
      .map(|generator| self.streaming_item(generator, None, from_initial_batch))
      .collect();
    self.batcher.enqueue_items(items);
    Ok(())
  }

  fn register_submissions(&self, count: usize) -> Result<(), BatcherError> {
    let mut state = self.shared.state.lock();
    if state.closed {
      debug!(stream = %self.shared.name, count, "Rejected submission to a closed result stream.");
      return Err(BatcherError::StreamClosed);
    }
    state.total_submitted += count as u64;
    Ok(())
  }

  fn handled_streaming_item<G, Fut>(&self, generator: G) -> (QueueItem, ResultHandle<T, E>)
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let (result_tx, result_rx) = oneshot::channel();
    let item = self.streaming_item(generator, Some(result_tx), false);
    let handle = ResultHandle::new(item.task_id, result_rx);
    (item, handle)
  }

  fn streaming_item<G, Fut>(
    &self,
    generator: G,
    result_tx: Option<oneshot::Sender<TaskOutcome<T, E>>>,
    from_initial_batch: bool,
  ) -> QueueItem
  where
    G: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let task_id = next_task_id();
    let shared = self.shared.clone();
    QueueItem {
      task_id,
      job: Box::new(move || {
        async move {
          let outcome = run_guarded(generator).await;
          shared.record_outcome(task_id, &outcome, from_initial_batch);
          if let Some(tx) = result_tx {
            if tx.send(outcome).is_err() {
              trace!(stream = %shared.name, %task_id, "Result handle dropped; outcome only published to the stream.");
            }
          }
        }
        .boxed()
      }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::StreamExt;
  use std::time::Duration;

  #[tokio::test]
  async fn test_register_rejects_after_close() {
    let streaming = StreamingBatcher::<u32, String>::new(1).unwrap();
    streaming.close();
    assert_eq!(streaming.add_one(|| async { Ok(1) }), Err(BatcherError::StreamClosed));
    assert_eq!(streaming.total_submitted(), 0);
  }

  #[tokio::test]
  async fn test_dropped_subscribers_are_pruned() {
    let streaming = StreamingBatcher::<u32, String>::new(1).unwrap();
    let _initial = streaming.results();
    let extra = streaming.subscribe();
    assert_eq!(streaming.subscriber_count(), 2);
    drop(extra);

    streaming.add_one(|| async { Ok(1) }).unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
      while streaming.resolved_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("task did not resolve");
    assert_eq!(streaming.subscriber_count(), 1);
  }

  #[tokio::test]
  async fn test_events_carry_task_ids_of_handles() {
    let streaming = StreamingBatcher::<u32, String>::new(2).unwrap();
    let results = streaming.results();
    let handle = streaming.get_one(|| async { Ok(5) }).unwrap();
    let expected_id = handle.id();
    streaming.set_close_when_idle(true);

    assert_eq!(handle.await, Ok(5));
    let events: Vec<_> = results.collect().await;
    assert_eq!(
      events,
      vec![TaskEvent::Completed {
        task_id: expected_id,
        value: 5
      }]
    );
  }

  #[tokio::test]
  async fn test_handles_only_batcher_retains_no_events() {
    let streaming = StreamingBatcher::<u32, String>::new(4).unwrap();
    assert_eq!(streaming.subscriber_count(), 0);

    for round in 0..5u32 {
      let handles = streaming
        .get_many((0..100).map(move |i| move || async move { Ok(round * 100 + i) }))
        .unwrap();
      futures::future::join_all(handles).await;
    }
    assert_eq!(streaming.resolved_count(), 500);
    assert_eq!(streaming.subscriber_count(), 0);

    streaming.close();
    let events: Vec<_> = streaming.results().collect().await;
    assert!(events.is_empty());
  }

  #[tokio::test]
  async fn test_unclaimed_replay_stops_buffering_after_initial_batch() {
    let streaming = StreamingBatcher::<u32, String>::from_tasks((0..3).map(|i| move || async move { Ok(i) }), 2, false)
      .unwrap();
    assert_eq!(streaming.subscriber_count(), 1);

    tokio::time::timeout(Duration::from_secs(2), async {
      while streaming.resolved_count() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("initial batch did not resolve");
    assert_eq!(streaming.subscriber_count(), 0);

    // Work submitted after the initial batch is not kept for a later claim.
    let handles = streaming.get_many((10..20).map(|i| move || async move { Ok(i) })).unwrap();
    futures::future::join_all(handles).await;
    {
      let state = streaming.shared.state.lock();
      let replay = state.initial_replay.as_ref().unwrap();
      assert!(replay.tx.is_none());
      assert_eq!(replay.receiver.len(), 3);
    }

    let results = streaming.results();
    assert_eq!(streaming.subscriber_count(), 1);
    streaming.add_one(|| async { Ok(99) }).unwrap();
    streaming.set_close_when_idle(true);

    let values: Vec<u32> = results.map(|event| event.into_result().unwrap()).collect().await;
    assert_eq!(values.len(), 4);
    assert_eq!(values[3], 99);
    let mut replayed = values[..3].to_vec();
    replayed.sort_unstable();
    assert_eq!(replayed, vec![0, 1, 2]);
  }
}
