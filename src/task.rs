use crate::cell::WriteOnce;
use crate::error::{PoolError, TaskError};
use crate::executor::{Executor, Work};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, trace};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// The outcome of a finished [`Task`].
pub type TaskOutcome<T, E> = Result<T, TaskError<E>>;

/// A handle to one asynchronous unit of work with a success or failure outcome.
///
/// Handles are cheap to clone; every clone observes the same outcome. The
/// outcome is written exactly once: the first of `complete`, `fail`, `abort`
/// (or the executor running the task) wins and every later write is ignored.
pub struct Task<T, E> {
  task_id: u64,
  outcome: Arc<WriteOnce<TaskOutcome<T, E>>>,
}

impl<T, E> Clone for Task<T, E> {
  fn clone(&self) -> Self {
    Self {
      task_id: self.task_id,
      outcome: self.outcome.clone(),
    }
  }
}

impl<T, E> fmt::Debug for Task<T, E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("task_id", &self.task_id)
      .field("done", &self.outcome.is_set())
      .finish()
  }
}

impl<T, E> Task<T, E> {
  /// Creates an unresolved task whose outcome is supplied later by the caller.
  pub fn pending() -> Self {
    Self {
      task_id: NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
      outcome: Arc::new(WriteOnce::new()),
    }
  }

  /// Creates a task that has already succeeded with `value`.
  pub fn completed(value: T) -> Self {
    Self::resolved(Ok(value))
  }

  /// Creates a task that has already failed with `err`.
  pub fn failed(err: E) -> Self {
    Self::resolved(Err(TaskError::Failed(err)))
  }

  fn resolved(outcome: TaskOutcome<T, E>) -> Self {
    Self {
      task_id: NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
      outcome: Arc::new(WriteOnce::resolved(outcome)),
    }
  }

  /// Returns the unique ID of this task.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  pub fn is_done(&self) -> bool {
    self.outcome.is_set()
  }

  /// Resolves the task as succeeded. Returns `false` if it was already resolved.
  pub fn complete(&self, value: T) -> bool {
    self.resolve(Ok(value))
  }

  /// Resolves the task as failed with its own error. Returns `false` if it was already resolved.
  pub fn fail(&self, err: E) -> bool {
    self.resolve(Err(TaskError::Failed(err)))
  }

  /// Forces the task to a failed outcome on behalf of a failing producer.
  ///
  /// The work behind the handle, if any, keeps running; its eventual outcome is discarded.
  pub fn abort(&self, err: E) -> bool {
    self.resolve(Err(TaskError::Aborted(err)))
  }

  pub(crate) fn resolve(&self, outcome: TaskOutcome<T, E>) -> bool {
    let won = self.outcome.set(outcome);
    if !won {
      trace!(task_id = %self.task_id, "Task already resolved; later outcome ignored.");
    }
    won
  }

  /// Registers a callback that runs once with the outcome, on the thread that resolves the task.
  /// If the task is already resolved the callback runs immediately on the calling thread.
  pub fn on_complete(&self, callback: impl FnOnce(&TaskOutcome<T, E>) + Send + 'static) {
    self.outcome.on_set(callback);
  }
}

impl<T: Clone, E: Clone> Task<T, E> {
  /// Returns the outcome if the task has finished.
  pub fn outcome(&self) -> Option<TaskOutcome<T, E>> {
    self.outcome.get()
  }

  /// Waits for the task to finish and returns its outcome.
  pub async fn wait(&self) -> TaskOutcome<T, E> {
    self.outcome.wait().await
  }
}

/// Resolves the held task as `Cancelled` if dropped before an outcome was delivered.
///
/// Lives inside the work future, so an executor that discards the work
/// (shutdown, forceful cancellation) still unblocks everyone waiting on the task.
struct TaskWriter<T, E> {
  task: Option<Task<T, E>>,
}

impl<T, E> TaskWriter<T, E> {
  fn deliver(mut self, outcome: TaskOutcome<T, E>) {
    if let Some(task) = self.task.take() {
      task.resolve(outcome);
    }
  }
}

impl<T, E> Drop for TaskWriter<T, E> {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      if task.resolve(Err(TaskError::Cancelled)) {
        trace!(task_id = %task.id(), "Task work dropped before completion; resolved as cancelled.");
      }
    }
  }
}

/// Submits `future` to `executor` and returns the task tracking it.
///
/// Creating the task is what schedules it: the future is queued on the
/// executor before this function returns. Panics inside the future resolve
/// the task as [`TaskError::Panicked`].
pub fn spawn_task<X, T, E, F>(executor: &X, future: F) -> Result<Task<T, E>, PoolError>
where
  X: Executor + ?Sized,
  F: Future<Output = Result<T, E>> + Send + 'static,
  T: Send + Sync + 'static,
  E: Send + Sync + 'static,
{
  let task = Task::pending();
  let task_id = task.id();
  let writer = TaskWriter {
    task: Some(task.clone()),
  };

  let work: Work = Box::pin(async move {
    let writer = writer;
    let outcome = match AssertUnwindSafe(future).catch_unwind().await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(err)) => Err(TaskError::Failed(err)),
      Err(_panic_payload) => {
        error!(%task_id, "Task panicked during execution.");
        Err(TaskError::Panicked)
      }
    };
    writer.deliver(outcome);
  });

  executor.execute(work)?;
  Ok(task)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_first_resolution_wins() {
    let task: Task<u32, String> = Task::pending();
    assert!(!task.is_done());
    assert!(task.complete(1));
    assert!(!task.fail("late".to_string()));
    assert!(!task.abort("later".to_string()));
    assert_eq!(task.outcome(), Some(Ok(1)));
  }

  #[test]
  fn test_clones_share_outcome() {
    let task: Task<(), String> = Task::pending();
    let clone = task.clone();
    assert_eq!(task.id(), clone.id());
    clone.abort("producer".to_string());
    assert_eq!(task.outcome(), Some(Err(TaskError::Aborted("producer".to_string()))));
  }

  #[test]
  fn test_dropped_writer_cancels_task() {
    let task: Task<(), String> = Task::pending();
    drop(TaskWriter {
      task: Some(task.clone()),
    });
    assert_eq!(task.outcome(), Some(Err(TaskError::Cancelled)));
  }

  #[tokio::test]
  async fn test_spawn_task_on_tokio_handle() {
    let handle = tokio::runtime::Handle::current();
    let ok = spawn_task(&handle, async { Ok::<_, String>(5u8) }).unwrap();
    let failed = spawn_task(&handle, async { Err::<u8, _>("nope".to_string()) }).unwrap();
    let panicked = spawn_task(&handle, async {
      if true {
        panic!("boom");
      }
      Ok::<u8, String>(0)
    })
    .unwrap();

    assert_eq!(ok.wait().await, Ok(5));
    assert_eq!(failed.wait().await, Err(TaskError::Failed("nope".to_string())));
    assert_eq!(panicked.wait().await, Err(TaskError::Panicked));
  }
}
