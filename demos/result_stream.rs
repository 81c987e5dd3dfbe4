use task_batcher::{StreamingBatcher, TaskEvent};
use futures::StreamExt;
use std::time::Duration;
use tracing::info;

async fn fetch(id: u32) -> Result<u32, String> {
  tokio::time::sleep(Duration::from_millis(100 + u64::from(id % 4) * 75)).await;
  if id % 5 == 4 {
    Err(format!("request {} timed out upstream", id))
  } else {
    Ok(id * 10)
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Result Stream Example ---");

  let streaming = StreamingBatcher::from_tasks((0..10).map(|id| move || fetch(id)), 3, true)
    .expect("Failed to create streaming batcher");

  let mut results = streaming.results();
  while let Some(event) = results.next().await {
    match event {
      TaskEvent::Completed { task_id, value } => info!("Task {} completed with {}", task_id, value),
      TaskEvent::Failed { task_id, error } => info!("Task {} failed: {}", task_id, error),
    }
  }

  info!(
    "Stream closed after {} of {} tasks resolved.",
    streaming.resolved_count(),
    streaming.total_submitted()
  );
  info!("--- Result Stream Example End ---");
}
