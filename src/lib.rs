//! A Tokio-based batcher that runs deferred futures with a live-adjustable
//! concurrency limit, delivering outcomes through per-task handles or a
//! merged, multi-subscriber result stream.

mod batcher;
mod compose;
mod config;
mod error;
mod handle;
mod streaming;
mod task;
mod worker_pool;

pub use batcher::Batcher;
pub use compose::{get_all, stream_all};
pub use config::BatcherConfig;
pub use error::{BatcherError, TaskError};
pub use handle::ResultHandle;
pub use streaming::{ResultStream, StreamingBatcher, TaskEvent};
pub use task::{TaskFuture, TaskGenerator, TaskOutcome};
