use task_batcher::{get_all, Batcher, BatcherConfig, BatcherError, TaskError};
use futures::future::BoxFuture;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Tracks how many generators are running at once and the peak seen so far.
#[derive(Default)]
struct ConcurrencyGauge {
  current: AtomicUsize,
  peak: AtomicUsize,
  finished: AtomicUsize,
}

impl ConcurrencyGauge {
  fn enter(&self) {
    let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  fn exit(&self) {
    self.current.fetch_sub(1, Ordering::SeqCst);
    self.finished.fetch_add(1, Ordering::SeqCst);
  }
}

// Helper producing a generator that sleeps, records itself in the gauge and
// returns `output`.
fn timed_task(
  output: usize,
  duration_ms: u64,
  gauge: Arc<ConcurrencyGauge>,
) -> impl FnOnce() -> BoxFuture<'static, Result<usize, String>> + Send + 'static {
  move || -> BoxFuture<'static, Result<usize, String>> {
    Box::pin(async move {
      gauge.enter();
      sleep(Duration::from_millis(duration_ms)).await;
      gauge.exit();
      tracing::info!("Task {} completed.", output);
      Ok(output)
    })
  }
}

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,task_batcher=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

async fn wait_until_idle<T: Send + 'static, E: Send + 'static>(batcher: &Batcher<T, E>) {
  timeout(Duration::from_secs(5), async {
    while !batcher.is_idle() {
      sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("batcher did not go idle");
}

#[tokio::test]
async fn test_get_one_returns_generator_value() {
  setup_tracing_for_test();
  let batcher = Batcher::<String, String>::new(2).unwrap();

  let handle = batcher.get_one(|| async { Ok("task1_done".to_string()) });
  assert_eq!(handle.await_result().await, Ok("task1_done".to_string()));
}

#[tokio::test]
async fn test_invalid_worker_count_is_rejected() {
  setup_tracing_for_test();
  assert!(matches!(
    Batcher::<u32, String>::new(0),
    Err(BatcherError::InvalidWorkerCount(0))
  ));

  let batcher = Batcher::<u32, String>::new(3).unwrap();
  assert_eq!(batcher.set_worker_count(0), Err(BatcherError::InvalidWorkerCount(0)));
  assert_eq!(batcher.worker_count(), 3);

  // Unchanged count is a no-op.
  assert_eq!(batcher.set_worker_count(3), Ok(()));
  assert_eq!(batcher.worker_count(), 3);
}

#[test]
fn test_construction_outside_runtime_fails() {
  assert!(matches!(
    Batcher::<u32, String>::new(1),
    Err(BatcherError::NoRuntime)
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_tasks_three_workers_respects_limit() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::with_config(BatcherConfig::new(3).with_name("limit_of_three")).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());

  let handles = batcher.get_many((0..10).map(|i| timed_task(i, 50, gauge.clone())));
  assert_eq!(handles.len(), 10);

  let mut results = Vec::new();
  for handle in handles {
    results.push(handle.await.unwrap());
  }

  assert_eq!(results, (0..10).collect::<Vec<_>>());
  assert!(gauge.peak.load(Ordering::SeqCst) <= 3, "more than 3 tasks ran at once");
  assert_eq!(gauge.finished.load(Ordering::SeqCst), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_results_delivered_with_random_durations() {
  setup_tracing_for_test();
  let durations: Vec<u64> = {
    let mut rng = rand::rng();
    (0..40).map(|_| rng.random_range(1..20)).collect()
  };

  for worker_count in [1, 4, 16] {
    let batcher = Batcher::<usize, String>::new(worker_count).unwrap();
    let gauge = Arc::new(ConcurrencyGauge::default());
    let handles = batcher.get_many(
      durations
        .iter()
        .enumerate()
        .map(|(i, duration)| timed_task(i, *duration, gauge.clone())),
    );

    let results = futures::future::join_all(handles).await;
    let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, (0..40).collect::<Vec<_>>());
    assert!(gauge.peak.load(Ordering::SeqCst) <= worker_count);
  }
}

#[tokio::test]
async fn test_failures_are_isolated_to_their_handles() {
  setup_tracing_for_test();
  let batcher = Batcher::<u32, String>::new(1).unwrap();

  let failing = batcher.get_one(|| async { Err("disk on fire".to_string()) });
  let panicking = batcher.get_one(|| async {
    if true {
      panic!("Task intentionally panicked!");
    }
    Ok(0)
  });
  let healthy = batcher.get_one(|| async { Ok(7) });

  assert_eq!(failing.await, Err(TaskError::Failed("disk on fire".to_string())));
  assert_eq!(panicking.await, Err(TaskError::Panicked));
  assert_eq!(healthy.await, Ok(7));
}

#[tokio::test]
async fn test_fire_and_forget_failures_are_discarded() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::new(2).unwrap();
  let executed = Arc::new(AtomicUsize::new(0));

  batcher.add_many((0..6).map(|i| {
    let executed = executed.clone();
    move || async move {
      executed.fetch_add(1, Ordering::SeqCst);
      if i % 2 == 0 {
        Err(format!("task {} failed", i))
      } else {
        Ok(i)
      }
    }
  }));
  batcher.add_one(|| async { Err("nobody is listening".to_string()) });

  wait_until_idle(&batcher).await;
  assert_eq!(executed.load(Ordering::SeqCst), 6);

  // The pool keeps working after swallowed failures.
  assert_eq!(batcher.get_one(|| async { Ok(99) }).await, Ok(99));
}

#[tokio::test]
async fn test_dropped_handle_does_not_stop_execution() {
  setup_tracing_for_test();
  let batcher = Batcher::<u32, String>::new(1).unwrap();
  let executed = Arc::new(AtomicUsize::new(0));

  let counter = executed.clone();
  drop(batcher.get_one(move || async move {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok(1)
  }));

  assert_eq!(batcher.get_one(|| async { Ok(2) }).await, Ok(2));
  assert_eq!(executed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_introspection_reflects_queue_and_workers() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::new(1).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());
  assert!(batcher.is_idle());
  assert!(batcher.is_queue_empty());

  let handles = batcher.get_many((0..5).map(|i| timed_task(i, 5, gauge.clone())));
  // Nothing has been polled yet on this single-threaded runtime.
  assert_eq!(batcher.queue_length(), 5);
  assert_eq!(batcher.running_worker_count(), 1);
  assert!(!batcher.is_idle());

  futures::future::join_all(handles).await;
  wait_until_idle(&batcher).await;
  assert!(batcher.is_queue_empty());
  assert_eq!(batcher.active_task_count(), 0);
}

#[tokio::test]
async fn test_growing_worker_count_spawns_immediately() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::new(1).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());

  let handles = batcher.get_many((0..6).map(|i| timed_task(i, 50, gauge.clone())));
  assert_eq!(batcher.running_worker_count(), 1);

  batcher.set_worker_count(4).unwrap();
  assert_eq!(batcher.running_worker_count(), 4);

  // Never more workers than queued work.
  batcher.set_worker_count(10).unwrap();
  assert_eq!(batcher.running_worker_count(), 6);

  let results = futures::future::join_all(handles).await;
  assert_eq!(results.into_iter().filter(|r| r.is_ok()).count(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_raise_worker_count_after_third_completion() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::new(1).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());

  let handles = batcher.get_many((0..5).map(|i| timed_task(i, 40, gauge.clone())));

  timeout(Duration::from_secs(5), async {
    while gauge.finished.load(Ordering::SeqCst) < 3 {
      sleep(Duration::from_millis(2)).await;
    }
  })
  .await
  .expect("first three tasks did not finish");
  assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);

  batcher.set_worker_count(5).unwrap();

  let mut results = Vec::new();
  for handle in handles {
    results.push(handle.await.unwrap());
  }
  assert_eq!(results, vec![0, 1, 2, 3, 4]);
  assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shrinking_worker_count_retires_surplus_without_losing_work() {
  setup_tracing_for_test();
  let batcher = Batcher::<usize, String>::new(4).unwrap();
  let gauge = Arc::new(ConcurrencyGauge::default());

  let handles = batcher.get_many((0..12).map(|i| timed_task(i, 100, gauge.clone())));
  timeout(Duration::from_secs(5), async {
    while gauge.current.load(Ordering::SeqCst) < 4 {
      sleep(Duration::from_millis(2)).await;
    }
  })
  .await
  .expect("four tasks never ran at once");
  let finished_before_shrink = gauge.finished.load(Ordering::SeqCst);

  batcher.set_worker_count(1).unwrap();
  // In-flight tasks are not interrupted.
  assert_eq!(gauge.finished.load(Ordering::SeqCst), finished_before_shrink);
  assert_eq!(batcher.worker_count(), 1);

  timeout(Duration::from_secs(5), async {
    while batcher.running_worker_count() != 1 || gauge.current.load(Ordering::SeqCst) != 1 {
      sleep(Duration::from_millis(2)).await;
    }
  })
  .await
  .expect("surplus workers did not retire");

  let mut results = Vec::new();
  for handle in handles {
    results.push(handle.await.unwrap());
  }
  assert_eq!(results, (0..12).collect::<Vec<_>>());
  assert_eq!(gauge.finished.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn test_get_all_helper_runs_whole_batch() {
  setup_tracing_for_test();
  let gauge = Arc::new(ConcurrencyGauge::default());
  let handles = get_all((0..8).map(|i| timed_task(i, 5, gauge.clone())), 3).unwrap();

  let values: Vec<usize> = futures::future::join_all(handles)
    .await
    .into_iter()
    .map(|r| r.unwrap())
    .collect();
  assert_eq!(values, (0..8).collect::<Vec<_>>());
  assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
}
