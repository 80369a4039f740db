use crate::error::PoolError;
use crate::executor::{Executor, Work};
use crate::task::{spawn_task, Task};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_WORK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how the pool should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for currently active work to complete.
  /// Queued work that hasn't started will not be processed.
  Graceful,
  /// Attempts to cancel all active work.
  /// Queued work that hasn't started will not be processed.
  ForcefulCancel,
}

/// Work waiting in the pool queue together with the token that can cancel it.
struct QueuedWork {
  work_id: u64,
  work: Work,
  token: CancellationToken,
}

/// A named worker pool that runs at most `concurrency_limit` units of work at a time.
///
/// Submission never waits: work lands on an unbounded queue that a single
/// worker loop drains whenever a concurrency permit is free. Work dropped by a
/// shutdown is never run; tasks created through [`WorkerPool::spawn`] then
/// resolve as cancelled.
///
/// A chain running on the pool holds its own `Arc` to it until the chain
/// resolves, so dropping the caller's handle does not trigger the implicit
/// shutdown while a chain is pending. Call [`WorkerPool::shutdown`] to stop the
/// pool early; pending chains then fail with [`ChainError::Internal`](crate::ChainError::Internal).
pub struct WorkerPool {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  work_queue_tx: kanal::AsyncSender<QueuedWork>,
  active_work: Arc<DashMap<u64, CancellationToken>>,
  shutdown_token: CancellationToken,
  worker_join_handle_internal: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerPool {
  pub fn new(concurrency_limit: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let (tx, rx) = kanal::unbounded_async();
    let shutdown_token = CancellationToken::new();
    let worker_join_handle_internal_arc = Arc::new(Mutex::new(None));

    let pool_arc = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
      work_queue_tx: tx,
      active_work: Arc::new(DashMap::new()),
      shutdown_token: shutdown_token.clone(),
      worker_join_handle_internal: worker_join_handle_internal_arc.clone(),
    });

    let worker_pool_name = pool_arc.pool_name.clone();
    let worker_semaphore = pool_arc.semaphore.clone();
    let worker_active_work = pool_arc.active_work.clone();
    let worker_tokio_handle = tokio_handle.clone();

    let worker_loop_join_handle = tokio_handle.spawn(
      Self::run_worker_loop(
        worker_pool_name,
        worker_semaphore,
        rx,
        worker_tokio_handle,
        worker_active_work,
        shutdown_token,
      )
      .instrument(info_span!("worker_pool_loop", name = %pool_name)),
    );

    *worker_join_handle_internal_arc.lock() = Some(worker_loop_join_handle);

    pool_arc
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Returns the number of units of work currently running.
  pub fn active_task_count(&self) -> usize {
    self.active_work.len()
  }

  /// Returns the current number of units of work in the pending queue.
  pub fn queued_task_count(&self) -> usize {
    self.work_queue_tx.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Queues `future` on this pool and returns the task tracking its outcome.
  pub fn spawn<T, E, F>(&self, future: F) -> Result<Task<T, E>, PoolError>
  where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
  {
    spawn_task(self, future)
  }

  fn enqueue(&self, work: Work) -> Result<(), PoolError> {
    if self.shutdown_token.is_cancelled() || self.work_queue_tx.is_closed() {
      warn!(pool_name = %self.pool_name, "Execute: Attempted to submit work to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }

    let work_id = NEXT_POOL_WORK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let queued = QueuedWork {
      work_id,
      work,
      token: CancellationToken::new(),
    };

    trace!(pool_name = %self.pool_name, %work_id, "Submitting work to queue.");

    match self.work_queue_tx.try_send(queued) {
      Ok(true) => Ok(()),
      Ok(false) => {
        error!(pool_name = %self.pool_name, %work_id, "Execute: Unbounded work queue refused work.");
        Err(PoolError::QueueSendError(format!("work {} was not accepted by the queue", work_id)))
      }
      Err(send_error) => {
        error!(
          pool_name = %self.pool_name,
          %work_id,
          "Execute: Failed to send work to queue. SendError: {:?}",
          send_error
        );
        if self.shutdown_token.is_cancelled() || self.work_queue_tx.is_closed() {
          Err(PoolError::PoolShuttingDown)
        } else {
          Err(PoolError::QueueSendChannelClosed)
        }
      }
    }
  }

  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      let _ = self.work_queue_tx.close();

      if mode == ShutdownMode::ForcefulCancel {
        let to_cancel: Vec<(u64, CancellationToken)> = self
          .active_work
          .iter()
          .map(|entry| (*entry.key(), entry.value().clone()))
          .collect();

        if to_cancel.is_empty() {
          info!(pool_name = %self.pool_name, "No active work to cancel forcefully.");
        }
        for (work_id, token) in to_cancel {
          debug!(pool_name = %self.pool_name, %work_id, "Forcefully cancelling active work during shutdown.");
          token.cancel();
        }
      } else {
        info!(pool_name = %self.pool_name, "Graceful shutdown: Allowing active work to complete.");
      }
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let handle_to_await: Option<JoinHandle<()>> = self.worker_join_handle_internal.lock().take();

    if let Some(handle) = handle_to_await {
      info!(pool_name = %self.pool_name, "Waiting for worker loop to join.");
      match handle.await {
        Ok(()) => info!(pool_name = %self.pool_name, "Worker loop successfully joined."),
        Err(join_error) => {
          error!(pool_name = %self.pool_name, "Error joining worker loop during shutdown: {:?}. Worker task might have panicked.", join_error);
        }
      }
    } else {
      trace!(pool_name = %self.pool_name, "Worker join handle already taken or was not set.");
    }

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    semaphore: Arc<Semaphore>,
    work_queue_rx: kanal::AsyncReceiver<QueuedWork>,
    work_tokio_handle: TokioHandle,
    active_work_map: Arc<DashMap<u64, CancellationToken>>,
    shutdown_token: CancellationToken,
  ) {
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal (token) received. Worker loop terminating.");
          break;
        }

        permit_acquisition_result = semaphore.clone().acquire_owned() => {
          let permit = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!(name = %*pool_name, "Semaphore closed. Worker loop exiting.");
              break;
            }
          };

          let next: Option<(QueuedWork, OwnedSemaphorePermit)> = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
              info!(name = %*pool_name, "Shutdown signal received while holding permit and waiting for work. Releasing permit.");
              None
            }
            recv_result = work_queue_rx.recv() => {
              match recv_result {
                Ok(queued) => Some((queued, permit)),
                Err(_) => {
                  info!(name = %*pool_name, "Work queue closed and empty. Releasing permit.");
                  None
                }
              }
            }
          };

          let Some((queued, permit)) = next else {
            continue;
          };

          let QueuedWork { work_id, work, token } = queued;
          active_work_map.insert(work_id, token.clone());
          trace!(name = %*pool_name, %work_id, "Dequeued work. Spawning with permit.");

          let active_work_cleanup = active_work_map.clone();
          let pool_name_for_work = pool_name.clone();
          let pool_name_for_span = pool_name.clone();

          work_tokio_handle.spawn(
            async move {
              let _permit_guard = permit;

              tokio::select! {
                biased;
                _ = token.cancelled() => {
                  debug!(pool_name = %*pool_name_for_work, %work_id, "Work cancelled by its token; dropping it.");
                },
                run_result = AssertUnwindSafe(work).catch_unwind() => {
                  if run_result.is_err() {
                    error!(pool_name = %*pool_name_for_work, %work_id, "Work panicked during execution.");
                  }
                }
              }
            }
            .instrument(info_span!("pool_work", pool_name = %*pool_name_for_span, %work_id))
            .then(move |_| {
              active_work_cleanup.remove(&work_id);
              async {}
            }),
          );
        }
      }
    }

    // Anything still queued is dropped here, which cancels the tasks it carried.
    let mut discarded = 0usize;
    while let Ok(Some(queued)) = work_queue_rx.try_recv() {
      drop(queued);
      discarded += 1;
    }

    info!(
      name = %*pool_name,
      "Worker loop stopped. Discarded {} queued units of work; active work remaining: {}",
      discarded,
      active_work_map.len()
    );
  }
}

impl Executor for WorkerPool {
  fn execute(&self, work: Work) -> Result<(), PoolError> {
    self.enqueue(work)
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool dropped. Initiating implicit shutdown (signaling worker to stop, closing queue)."
      );
      self.shutdown_token.cancel();
      let _ = self.work_queue_tx.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
