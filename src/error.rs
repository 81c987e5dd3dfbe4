use thiserror::Error;

/// Errors reported synchronously by `Batcher` and `StreamingBatcher` operations.
///
/// None of these leave the batcher in a corrupted state; the failing call is
/// simply rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatcherError {
  #[error("Worker count must be at least 1, got {0}")]
  InvalidWorkerCount(usize),

  #[error("No Tokio runtime available to spawn batcher workers")]
  NoRuntime,

  #[error("Result stream is closed, cannot accept new tasks")]
  StreamClosed,
}

/// The failure side of a task outcome, delivered through a `ResultHandle` or
/// published on a result stream as `TaskEvent::Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
  #[error("Task failed: {0}")]
  Failed(E),

  #[error("Task panicked during execution")]
  Panicked,

  #[error("Task result channel closed before an outcome was delivered")]
  ResultChannelClosed,
}

impl<E> TaskError<E> {
  /// Returns the generator's own error, if this is a `Failed` outcome.
  pub fn into_inner(self) -> Option<E> {
    match self {
      TaskError::Failed(e) => Some(e),
      _ => None,
    }
  }
}
