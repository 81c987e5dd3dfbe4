use task_batcher::{Batcher, BatcherConfig, ResultHandle};
use std::time::Duration;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> Result<String, String> {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  if id == 3 {
    return Err(format!("Task {} hit a simulated I/O error", id));
  }
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let batcher = Batcher::<String, String>::with_config(BatcherConfig::new(2).with_name("basic_batcher"))
    .expect("Failed to create batcher");

  let mut handles: Vec<ResultHandle<String, String>> = Vec::new();

  for i in 0..5 {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 500 + (i as u64 % 3 * 250);
    let handle = batcher.get_one(move || my_task_fn(i, sleep_duration));
    info!("Submitted task {} with handle id {}", i, handle.id());
    handles.push(handle);
  }

  // Fire-and-forget: the outcome is discarded, failures included.
  batcher.add_one(|| async { Err("nobody will see this".to_string()) });

  info!("All tasks submitted. Awaiting results...");

  for handle in handles {
    let task_id = handle.id();
    match handle.await_result().await {
      Ok(result) => info!("Result for task {}: {}", task_id, result),
      Err(e) => info!("Error for task {}: {}", task_id, e),
    }
  }

  info!("--- Basic Usage Example End ---");
}
