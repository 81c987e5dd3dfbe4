use crate::error::BatcherError;

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::runtime::Handle as TokioHandle;

lazy_static::lazy_static! {
  static ref NEXT_BATCHER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Construction parameters shared by `Batcher` and `StreamingBatcher`.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
  /// Initial number of concurrent workers. Must be at least 1.
  pub worker_count: usize,
  /// Name attached to every log line emitted by the batcher.
  /// Defaults to `batcher-<n>`.
  pub name: Option<String>,
  /// Runtime used to spawn workers. Defaults to the runtime of the
  /// constructing task.
  pub runtime: Option<TokioHandle>,
}

impl BatcherConfig {
  pub fn new(worker_count: usize) -> Self {
    Self {
      worker_count,
      name: None,
      runtime: None,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_runtime(mut self, handle: TokioHandle) -> Self {
    self.runtime = Some(handle);
    self
  }

  /// Validates the worker count and fills in the defaults.
  pub(crate) fn resolve(self) -> Result<ResolvedConfig, BatcherError> {
    if self.worker_count < 1 {
      return Err(BatcherError::InvalidWorkerCount(self.worker_count));
    }
    let runtime = match self.runtime {
      Some(handle) => handle,
      None => TokioHandle::try_current().map_err(|_| BatcherError::NoRuntime)?,
    };
    let name = self.name.unwrap_or_else(|| {
      format!("batcher-{}", NEXT_BATCHER_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    });
    Ok(ResolvedConfig {
      worker_count: self.worker_count,
      name,
      runtime,
    })
  }
}

impl Default for BatcherConfig {
  fn default() -> Self {
    Self::new(1)
  }
}

#[derive(Debug)]
pub(crate) struct ResolvedConfig {
  pub(crate) worker_count: usize,
  pub(crate) name: String,
  pub(crate) runtime: TokioHandle,
}
