use thiserror::Error;

/// Errors raised by the executors themselves, independent of any task outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Failed to submit work to the pool queue: {0}")]
  QueueSendError(String),

  #[error("Pool's internal work queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Pool is shutting down or already shut down, cannot accept new work")]
  PoolShuttingDown,
}

/// The failed outcome of a single [`Task`](crate::Task).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
  /// The task's future returned its own error.
  #[error("Task failed: {0}")]
  Failed(E),

  /// The task was force-failed because the producer failed while its batch was being pulled.
  #[error("Task aborted after producer failure: {0}")]
  Aborted(E),

  /// The task was force-failed because pulling its batch failed internally (the producer panicked).
  #[error("Task abandoned after internal chain failure: {0}")]
  Abandoned(String),

  #[error("Task future panicked")]
  Panicked,

  /// The executor discarded the task before it produced an outcome.
  #[error("Task was cancelled")]
  Cancelled,
}

/// The failed outcome carried by a [`CompletionSignal`](crate::CompletionSignal).
///
/// Only the first error observed by a chain is ever recorded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError<E> {
  /// Pulling the next task from the producer failed.
  #[error("Producer failed while pulling the next task: {0}")]
  Producer(E),

  /// A task in the active batch failed.
  #[error("{0}")]
  Task(TaskError<E>),

  /// The scheduling logic itself failed (panic in the producer, rejected continuation, ...).
  #[error("Internal chain error: {0}")]
  Internal(String),

  #[error("Parallelism must be at least 1, got {0}")]
  InvalidParallelism(usize),
}
