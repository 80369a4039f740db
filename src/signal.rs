use crate::cell::WriteOnce;
use crate::error::ChainError;

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

struct SignalInner<E> {
  chain_name: Arc<String>,
  outcome: WriteOnce<Result<(), ChainError<E>>>,
  rounds: AtomicU64,
  tasks_pulled: AtomicU64,
}

/// The write-once outcome of a whole chain.
///
/// Resolves to `Ok(())` once the producer is exhausted and every produced
/// task has succeeded, or to the first error observed. Clones share the same
/// outcome. Await it directly or through [`CompletionSignal::wait`].
///
/// Signals are only created by the `chain_async*` functions.
pub struct CompletionSignal<E> {
  inner: Arc<SignalInner<E>>,
}

impl<E> Clone for CompletionSignal<E> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<E> fmt::Debug for CompletionSignal<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionSignal")
      .field("chain_name", &self.inner.chain_name)
      .field("done", &self.is_done())
      .field("rounds", &self.rounds())
      .field("tasks_pulled", &self.tasks_pulled())
      .finish()
  }
}

impl<E> CompletionSignal<E> {
  #[cfg(test)]
  pub(crate) fn new() -> Self {
    Self::named(Arc::new("chain".to_string()))
  }

  pub(crate) fn named(chain_name: Arc<String>) -> Self {
    Self {
      inner: Arc::new(SignalInner {
        chain_name,
        outcome: WriteOnce::new(),
        rounds: AtomicU64::new(0),
        tasks_pulled: AtomicU64::new(0),
      }),
    }
  }

  /// Returns the name of the chain this signal belongs to.
  pub fn chain_name(&self) -> &str {
    &self.inner.chain_name
  }

  pub fn is_done(&self) -> bool {
    self.inner.outcome.is_set()
  }

  /// Resolves the signal as succeeded. Returns `false`, changing nothing, if it was already resolved.
  pub fn succeed(&self) -> bool {
    let won = self.inner.outcome.set(Ok(()));
    if won {
      debug!(chain = %self.inner.chain_name, rounds = self.rounds(), "Chain completed successfully.");
    }
    won
  }

  /// Resolves the signal as failed. Returns `false`, changing nothing, if it was already resolved.
  pub fn fail(&self, err: ChainError<E>) -> bool {
    let won = self.inner.outcome.set(Err(err));
    if won {
      debug!(chain = %self.inner.chain_name, rounds = self.rounds(), "Chain resolved as failed.");
    } else {
      trace!(chain = %self.inner.chain_name, "Chain already resolved; later failure discarded.");
    }
    won
  }

  /// Number of batches submitted so far.
  pub fn rounds(&self) -> u64 {
    self.inner.rounds.load(Ordering::Acquire)
  }

  /// Number of tasks successfully pulled from the producer so far.
  pub fn tasks_pulled(&self) -> u64 {
    self.inner.tasks_pulled.load(Ordering::Acquire)
  }

  pub(crate) fn record_pull(&self) {
    self.inner.tasks_pulled.fetch_add(1, Ordering::AcqRel);
  }

  /// Counts a submitted batch and returns its 1-based round number.
  pub(crate) fn record_round(&self) -> u64 {
    self.inner.rounds.fetch_add(1, Ordering::AcqRel) + 1
  }
}

impl<E: Clone> CompletionSignal<E> {
  /// Returns the outcome if the chain has finished.
  pub fn outcome(&self) -> Option<Result<(), ChainError<E>>> {
    self.inner.outcome.get()
  }

  /// Waits for the chain to finish. Never blocks a thread.
  pub async fn wait(&self) -> Result<(), ChainError<E>> {
    self.inner.outcome.wait().await
  }
}

impl<E> IntoFuture for CompletionSignal<E>
where
  E: Clone + Send + Sync + 'static,
{
  type Output = Result<(), ChainError<E>>;
  type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'static>>;

  fn into_future(self) -> Self::IntoFuture {
    Box::pin(async move { self.wait().await })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_second_resolution_is_ignored() {
    let signal: CompletionSignal<String> = CompletionSignal::new();
    assert!(!signal.is_done());
    assert!(signal.succeed());
    assert!(!signal.fail(ChainError::Producer("late".to_string())));
    assert_eq!(signal.outcome(), Some(Ok(())));
  }

  #[test]
  fn test_failure_is_kept_over_later_success() {
    let signal: CompletionSignal<String> = CompletionSignal::new();
    assert!(signal.fail(ChainError::Internal("first".to_string())));
    assert!(!signal.succeed());
    assert!(!signal.fail(ChainError::Internal("second".to_string())));
    assert_eq!(signal.outcome(), Some(Err(ChainError::Internal("first".to_string()))));
  }

  #[tokio::test]
  async fn test_signal_is_awaitable() {
    let signal: CompletionSignal<String> = CompletionSignal::new();
    let resolver = signal.clone();
    tokio::spawn(async move {
      resolver.succeed();
    });
    assert_eq!(signal.await, Ok(()));
  }
}
