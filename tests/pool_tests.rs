use futures_chain::{Executor, PoolError, ShutdownMode, Task, TaskError, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// Helper to create a task future
async fn run_task(
  task_id_for_log: usize,
  duration_ms: u64,
  output_value: String,
  should_fail: bool,
  completion_flag: Option<Arc<AtomicBool>>,
) -> Result<String, String> {
  sleep(Duration::from_millis(duration_ms)).await;

  if should_fail {
    tracing::info!("Task {} failing as requested.", task_id_for_log);
    return Err(format!("task_{}_failed", task_id_for_log));
  }
  if let Some(flag) = completion_flag {
    flag.store(true, Ordering::SeqCst);
  }
  tracing::info!("Task {} completed successfully.", task_id_for_log);
  Ok(output_value)
}

async fn panicking_task() -> Result<String, String> {
  sleep(Duration::from_millis(10)).await;
  panic!("intentional panic inside pool task");
}

// Helper to initialize tracing for tests; Once ensures it runs once per test binary.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_chain=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

#[tokio::test]
async fn test_spawn_and_wait_basic_task() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, tokio::runtime::Handle::current(), "test_pool_basic_spawn");

  let task = pool.spawn(run_task(1, 50, "task1_done".to_string(), false, None)).unwrap();
  assert_eq!(task.wait().await, Ok("task1_done".to_string()));
  assert!(task.is_done());

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_task_errors_and_panics_are_captured() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, tokio::runtime::Handle::current(), "test_pool_failures");

  let failing = pool.spawn(run_task(1, 20, "unused".to_string(), true, None)).unwrap();
  assert_eq!(failing.wait().await, Err(TaskError::Failed("task_1_failed".to_string())));

  let panicking = pool.spawn(panicking_task()).unwrap();
  assert_eq!(panicking.wait().await, Err(TaskError::Panicked));

  // The pool keeps working after a panic.
  let normal = pool.spawn(run_task(2, 20, "task2_done".to_string(), false, None)).unwrap();
  assert_eq!(normal.wait().await, Ok("task2_done".to_string()));

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, tokio::runtime::Handle::current(), "test_pool_concurrency_limit");
  let running = Arc::new(AtomicUsize::new(0));
  let max_running = Arc::new(AtomicUsize::new(0));

  let mut tasks = Vec::new();
  for i in 0..6usize {
    let running = running.clone();
    let max_running = max_running.clone();
    let task: Task<usize, String> = pool
      .spawn(async move {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        max_running.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(40)).await;
        running.fetch_sub(1, Ordering::SeqCst);
        Ok(i)
      })
      .unwrap();
    tasks.push(task);
  }

  for (i, task) in tasks.iter().enumerate() {
    assert_eq!(task.wait().await, Ok(i));
  }
  assert!(max_running.load(Ordering::SeqCst) <= 2);
  assert_eq!(max_running.load(Ordering::SeqCst), 2);

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_graceful_allows_active_tasks_to_complete() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, tokio::runtime::Handle::current(), "test_pool_shutdown_graceful");

  let task1_completed_flag = Arc::new(AtomicBool::new(false));
  let task3_should_not_run_flag = Arc::new(AtomicBool::new(false));

  let task1 = pool
    .spawn(run_task(1, 200, "task1_done_graceful".to_string(), false, Some(task1_completed_flag.clone())))
    .unwrap();
  let task2 = pool
    .spawn(run_task(2, 250, "task2_done_graceful".to_string(), false, None))
    .unwrap();
  let task3 = pool
    .spawn(run_task(3, 10, "task3_queued_wont_run".to_string(), false, Some(task3_should_not_run_flag.clone())))
    .unwrap();

  sleep(Duration::from_millis(50)).await;
  assert_eq!(pool.active_task_count(), 2);
  assert_eq!(pool.queued_task_count(), 1);

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();

  assert_eq!(task1.wait().await, Ok("task1_done_graceful".to_string()));
  assert_eq!(task2.wait().await, Ok("task2_done_graceful".to_string()));
  assert!(task1_completed_flag.load(Ordering::SeqCst));

  // The queued task was discarded, which resolves it as cancelled.
  assert_eq!(task3.wait().await, Err(TaskError::Cancelled));
  assert!(!task3_should_not_run_flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_shutdown_forceful_cancels_active_tasks() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(2, tokio::runtime::Handle::current(), "test_pool_shutdown_forceful");
  let task1_completed_flag = Arc::new(AtomicBool::new(false));

  let task1 = pool
    .spawn(run_task(1, 5000, "task1_wont_finish".to_string(), false, Some(task1_completed_flag.clone())))
    .unwrap();
  let task2 = pool
    .spawn(run_task(2, 5000, "task2_wont_finish".to_string(), false, None))
    .unwrap();

  sleep(Duration::from_millis(50)).await;
  assert_eq!(pool.active_task_count(), 2);

  pool.shutdown(ShutdownMode::ForcefulCancel).await.unwrap();

  let outcome1 = tokio::time::timeout(Duration::from_secs(1), task1.wait()).await.unwrap();
  let outcome2 = tokio::time::timeout(Duration::from_secs(1), task2.wait()).await.unwrap();
  assert_eq!(outcome1, Err(TaskError::Cancelled));
  assert_eq!(outcome2, Err(TaskError::Cancelled));
  assert!(!task1_completed_flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_submit_to_shutting_down_pool_fails() {
  setup_tracing_for_test();
  let pool = WorkerPool::new(1, tokio::runtime::Handle::current(), "test_pool_submit_after_shutdown");

  let pool_for_shutdown = pool.clone();
  tokio::spawn(async move {
    pool_for_shutdown.shutdown(ShutdownMode::Graceful).await.ok();
  });
  sleep(Duration::from_millis(50)).await;

  assert!(pool.is_shutting_down());
  let spawn_result = pool.spawn(run_task(1, 10, "never".to_string(), false, None));
  assert_eq!(spawn_result.unwrap_err(), PoolError::PoolShuttingDown);
  assert_eq!(pool.execute(Box::pin(async {})), Err(PoolError::PoolShuttingDown));
}
