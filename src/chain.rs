use crate::error::{ChainError, TaskError};
use crate::executor::{Executor, Work};
use crate::producer::TaskProducer;
use crate::signal::CompletionSignal;
use crate::task::Task;

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Settings for one chain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
  /// Maximum number of tasks in flight at once; the size of each window.
  pub parallel: usize,
  /// Name attached to every log event and span of the chain.
  pub name: String,
}

impl Default for ChainConfig {
  fn default() -> Self {
    Self {
      parallel: 1,
      name: "chain".to_string(),
    }
  }
}

impl ChainConfig {
  pub fn new(parallel: usize) -> Self {
    Self {
      parallel,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }
}

struct ProducerCursor<P> {
  producer: P,
  exhausted: bool,
}

/// Everything one continuation needs; passed explicitly instead of captured by a self-referencing closure.
struct ChainState<P, T, E> {
  name: Arc<String>,
  cursor: Mutex<ProducerCursor<P>>,
  pool: Arc<dyn Executor>,
  parallel: usize,
  signal: CompletionSignal<E>,
  _task_output: PhantomData<fn() -> T>,
}

/// Runs the tasks of `producer` one at a time on `pool`.
///
/// Same as [`chain_async_with`] with `parallel = 1`: task `i + 1` is not even
/// created until task `i` has succeeded.
pub fn chain_async<P, T, E, X>(producer: P, pool: X) -> CompletionSignal<E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
  X: Executor + 'static,
{
  chain_async_with(producer, pool, 1)
}

/// Runs the tasks of `producer` in windows of at most `parallel` concurrent tasks.
///
/// No task of window `N + 1` is pulled from the producer before every task of
/// window `N` has succeeded. The first error, from the producer or from any
/// task, resolves the returned signal and stops the chain; tasks still running
/// in the failing window are left to finish on their own.
///
/// The first window is pulled on the calling thread; every later one is pulled
/// by a continuation scheduled on `pool`. This function never waits for a task.
///
/// The producer must create tasks only when asked. Handing over tasks that were
/// all created up front runs them outside of any window.
pub fn chain_async_with<P, T, E, X>(producer: P, pool: X, parallel: usize) -> CompletionSignal<E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
  X: Executor + 'static,
{
  chain_async_with_config(producer, pool, ChainConfig::new(parallel))
}

pub fn chain_async_with_config<P, T, E, X>(producer: P, pool: X, config: ChainConfig) -> CompletionSignal<E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
  X: Executor + 'static,
{
  let name = Arc::new(config.name);
  let signal = CompletionSignal::named(name.clone());

  if config.parallel == 0 {
    warn!(chain = %name, "Refusing to start chain with zero parallelism.");
    signal.fail(ChainError::InvalidParallelism(config.parallel));
    return signal;
  }

  let state = Arc::new(ChainState {
    name: name.clone(),
    cursor: Mutex::new(ProducerCursor {
      producer,
      exhausted: false,
    }),
    pool: Arc::new(pool),
    parallel: config.parallel,
    signal: signal.clone(),
    _task_output: PhantomData,
  });

  info!(chain = %name, parallel = config.parallel, "Starting chain.");
  let _span = info_span!("chain_advance", chain = %name, round = 1u64).entered();
  advance(state);

  signal
}

/// One step of the chain: pull the next window and arrange what happens when it finishes.
fn advance<P, T, E>(state: Arc<ChainState<P, T, E>>)
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  if let Err(panic_payload) = catch_unwind(AssertUnwindSafe(|| advance_round(&state))) {
    let message = panic_message(panic_payload.as_ref());
    error!(chain = %state.name, "Chain advance panicked: {}", message);
    state
      .signal
      .fail(ChainError::Internal(format!("advance panicked: {}", message)));
  }
}

fn advance_round<P, T, E>(state: &Arc<ChainState<P, T, E>>)
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  if state.signal.is_done() {
    trace!(chain = %state.name, "Chain already resolved; not pulling another window.");
    return;
  }

  let Some(batch) = pull_batch(state) else {
    return;
  };

  if batch.is_empty() {
    info!(chain = %state.name, rounds = state.signal.rounds(), tasks = state.signal.tasks_pulled(), "Producer exhausted; chain finished.");
    state.signal.succeed();
    return;
  }

  let round = state.signal.record_round();
  debug!(chain = %state.name, round, size = batch.len(), "Window submitted.");
  track_batch(state, batch, round);
}

/// Pulls up to `parallel` tasks. Returns `None` if the producer failed, in which
/// case the signal is already resolved and the partial window is aborted.
fn pull_batch<P, T, E>(state: &ChainState<P, T, E>) -> Option<Vec<Task<T, E>>>
where
  P: TaskProducer<T, E>,
  E: Clone,
{
  let mut cursor = state.cursor.lock();
  let mut batch = Vec::with_capacity(state.parallel);
  if cursor.exhausted {
    return Some(batch);
  }

  while batch.len() < state.parallel {
    let pulled = catch_unwind(AssertUnwindSafe(|| cursor.producer.next_task()));
    let next = match pulled {
      Ok(next) => next,
      Err(panic_payload) => {
        let message = format!("producer panicked: {}", panic_message(panic_payload.as_ref()));
        error!(chain = %state.name, slot = batch.len(), "{}; abandoning {} already pulled tasks.", message, batch.len());
        state.signal.fail(ChainError::Internal(message.clone()));
        for task in &batch {
          task.resolve(Err(TaskError::Abandoned(message.clone())));
        }
        return None;
      }
    };

    match next {
      None => {
        cursor.exhausted = true;
        break;
      }
      Some(Ok(task)) => {
        state.signal.record_pull();
        trace!(chain = %state.name, task_id = %task.id(), slot = batch.len(), "Pulled task.");
        batch.push(task);
      }
      Some(Err(err)) => {
        warn!(chain = %state.name, slot = batch.len(), "Producer failed; aborting {} already pulled tasks.", batch.len());
        state.signal.fail(ChainError::Producer(err.clone()));
        for task in &batch {
          task.abort(err.clone());
        }
        return None;
      }
    }
  }
  Some(batch)
}

/// Counting join over one window: the last success schedules the next advance,
/// any failure resolves the signal.
fn track_batch<P, T, E>(state: &Arc<ChainState<P, T, E>>, batch: Vec<Task<T, E>>, round: u64)
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  let remaining = Arc::new(AtomicUsize::new(batch.len()));

  for task in batch {
    let state = state.clone();
    let remaining = remaining.clone();
    let task_id = task.id();

    task.on_complete(move |outcome| match outcome {
      Ok(_) => {
        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
          trace!(chain = %state.name, round, "Window complete.");
          schedule_advance(state, round + 1);
        }
      }
      Err(err) => {
        if state.signal.fail(ChainError::Task(err.clone())) {
          warn!(chain = %state.name, round, %task_id, "Task failed: {}", describe(err));
        }
      }
    });
  }
}

/// Hands the next advance to the pool instead of running it on the completing task's thread.
fn schedule_advance<P, T, E>(state: Arc<ChainState<P, T, E>>, round: u64)
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  if state.signal.is_done() {
    return;
  }

  let pool = state.pool.clone();
  let signal = state.signal.clone();
  let span = info_span!("chain_advance", chain = %state.name, round);
  let stage = Arc::new(AtomicU8::new(SUBMITTING));
  let continuation = Continuation {
    state: Some(state),
    stage: stage.clone(),
  };
  let work: Work = Box::pin(async move { continuation.run() }.instrument(span));

  match pool.execute(work) {
    Ok(()) => {
      // The pool may already have discarded the work while `execute` was still running.
      if stage
        .compare_exchange(SUBMITTING, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
      {
        warn!(chain = %signal.chain_name(), round, "Chain continuation discarded by the pool.");
        signal.fail(ChainError::Internal(CONTINUATION_DROPPED.to_string()));
      }
    }
    Err(pool_error) => {
      error!(chain = %signal.chain_name(), round, "Pool rejected chain continuation: {}", pool_error);
      signal.fail(ChainError::Internal(format!(
        "pool rejected continuation for round {}: {}",
        round, pool_error
      )));
    }
  }
}

const SUBMITTING: u8 = 0;
const SUBMITTED: u8 = 1;
const DISCARDED_DURING_SUBMIT: u8 = 2;

const CONTINUATION_DROPPED: &str = "continuation dropped by the pool before it ran";

/// A scheduled advance. Fails the chain if the pool drops it without running it,
/// unless that happens inside `execute`, whose caller reports the outcome instead.
struct Continuation<P, T, E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  state: Option<Arc<ChainState<P, T, E>>>,
  stage: Arc<AtomicU8>,
}

impl<P, T, E> Continuation<P, T, E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn run(mut self) {
    if let Some(state) = self.state.take() {
      advance(state);
    }
  }
}

impl<P, T, E> Drop for Continuation<P, T, E>
where
  P: TaskProducer<T, E> + Send + 'static,
  T: Send + Sync + 'static,
  E: Clone + Send + Sync + 'static,
{
  fn drop(&mut self) {
    let Some(state) = self.state.take() else {
      return;
    };
    if self
      .stage
      .compare_exchange(SUBMITTING, DISCARDED_DURING_SUBMIT, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      return;
    }
    if state.signal.fail(ChainError::Internal(CONTINUATION_DROPPED.to_string())) {
      warn!(chain = %state.name, "Chain continuation discarded by the pool.");
    }
  }
}

fn describe<E>(err: &TaskError<E>) -> &'static str {
  match err {
    TaskError::Failed(_) => "returned an error",
    TaskError::Aborted(_) => "aborted",
    TaskError::Abandoned(_) => "abandoned",
    TaskError::Panicked => "panicked",
    TaskError::Cancelled => "cancelled",
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
