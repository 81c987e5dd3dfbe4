use task_batcher::Batcher;
use std::time::Duration;
use tracing::info;

async fn long_task_fn(id: usize) -> Result<String, String> {
  info!("Task {} starting (concurrency test - should take 1s)", id);
  tokio::time::sleep(Duration::from_secs(1)).await;
  let result = format!("Task {} finished", id);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Concurrency Limit Example (Limit: 1, raised to 4) ---");

  let batcher = Batcher::<String, String>::new(1).expect("Failed to create batcher");

  let num_tasks = 8;
  let handles = batcher.get_many((0..num_tasks).map(|i| move || long_task_fn(i)));

  // Let the single worker get through a couple of tasks, then open up.
  tokio::time::sleep(Duration::from_millis(2100)).await;
  info!(
    "Raising worker count to 4. Queue length: {}, running workers: {}",
    batcher.queue_length(),
    batcher.running_worker_count()
  );
  batcher.set_worker_count(4).expect("Worker count must be at least 1");

  for handle in handles {
    let task_id = handle.id();
    match handle.await {
      Ok(result) => info!("Task {} main: Received result: {}", task_id, result),
      Err(e) => info!("Task {} main: Received error: {}", task_id, e),
    }
  }

  info!("--- Concurrency Limit Example End ---");
}
