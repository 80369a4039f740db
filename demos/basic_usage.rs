use futures_chain::{chain_async_with_config, ChainConfig, ShutdownMode, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn my_task_fn(id: usize, delay_ms: u64) -> Result<String, String> {
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  Ok(result)
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let pool: Arc<WorkerPool> = WorkerPool::new(4, Handle::current(), "basic_pool");

  // Tasks are only created when the chain asks for them, three at a time.
  let pool_for_tasks = pool.clone();
  let producer = (0..7usize).map(move |task_id| {
    let sleep_duration: u64 = 200 + (task_id as u64 % 3 * 150);
    pool_for_tasks
      .spawn(my_task_fn(task_id, sleep_duration))
      .map_err(|e| e.to_string())
  });

  let config = ChainConfig::new(3).with_name("basic_chain");
  let signal = chain_async_with_config(producer, pool.clone(), config);
  info!("Chain started; the caller is free while windows run.");

  match signal.clone().await {
    Ok(()) => info!("Chain finished after {} windows.", signal.rounds()),
    Err(e) => info!("Chain failed: {}", e),
  }

  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Basic Usage Example End ---");
}
