use crate::error::TaskError;
use crate::task::TaskOutcome;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// A handle to a task submitted with `get_one`/`get_many`.
///
/// Resolves exactly once with the generator's outcome. The handle can be
/// awaited directly or through `await_result`. Dropping it does not affect
/// execution; the outcome is simply discarded.
#[derive(Debug)]
pub struct ResultHandle<T, E> {
  pub(crate) task_id: u64,
  pub(crate) result_receiver: oneshot::Receiver<TaskOutcome<T, E>>,
}

impl<T, E> ResultHandle<T, E> {
  pub(crate) fn new(task_id: u64, result_receiver: oneshot::Receiver<TaskOutcome<T, E>>) -> Self {
    Self {
      task_id,
      result_receiver,
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Awaits the completion of the task and returns its outcome.
  ///
  /// # Errors
  /// Returns `TaskError::Failed` with the generator's error if it failed.
  /// Returns `TaskError::Panicked` if the generator panicked.
  /// Returns `TaskError::ResultChannelClosed` if the task was dropped without
  /// running to completion (e.g. its runtime shut down).
  pub async fn await_result(self) -> TaskOutcome<T, E> {
    self.await
  }
}

impl<T, E> Future for ResultHandle<T, E> {
  type Output = TaskOutcome<T, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();
    match Pin::new(&mut this.result_receiver).poll(cx) {
      Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
      Poll::Ready(Err(recv_error)) => {
        tracing::warn!(task_id = %this.task_id, "Result channel receive error: {}", recv_error);
        Poll::Ready(Err(TaskError::ResultChannelClosed))
      }
      Poll::Pending => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_handle_resolves_with_sent_outcome() {
    let (tx, rx) = oneshot::channel::<TaskOutcome<u32, String>>();
    let handle = ResultHandle::new(42, rx);
    assert_eq!(handle.id(), 42);

    tx.send(Err(TaskError::Failed("nope".to_string()))).unwrap();
    assert_eq!(handle.await_result().await, Err(TaskError::Failed("nope".to_string())));
  }

  #[tokio::test]
  async fn test_handle_reports_dropped_sender() {
    let (tx, rx) = oneshot::channel::<TaskOutcome<u32, String>>();
    let handle = ResultHandle::new(1, rx);
    drop(tx);
    assert_eq!(handle.await, Err(TaskError::ResultChannelClosed));
  }
}
