use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use tokio::sync::Notify;
use tracing::error;

const RUNNING: u8 = 0;
const WRITING: u8 = 1;
const DONE: u8 = 2;

type Callback<V> = Box<dyn FnOnce(&V) + Send + 'static>;

/// A write-once outcome cell.
///
/// The state moves `RUNNING -> DONE` through a compare-and-set, so among
/// concurrent writers exactly one wins and the rest observe `false`.
/// Observers either await the value or register a callback that runs
/// exactly once with it.
pub(crate) struct WriteOnce<V> {
  state: AtomicU8,
  value: OnceLock<V>,
  callbacks: Mutex<Vec<Callback<V>>>,
  notify: Notify,
}

impl<V> WriteOnce<V> {
  pub(crate) fn new() -> Self {
    Self {
      state: AtomicU8::new(RUNNING),
      value: OnceLock::new(),
      callbacks: Mutex::new(Vec::new()),
      notify: Notify::new(),
    }
  }

  pub(crate) fn resolved(value: V) -> Self {
    let cell = Self::new();
    let _ = cell.value.set(value);
    cell.state.store(DONE, Ordering::Release);
    cell
  }

  /// Records `value` if nothing has been recorded yet. Returns whether this call won.
  pub(crate) fn set(&self, value: V) -> bool {
    if self
      .state
      .compare_exchange(RUNNING, WRITING, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return false;
    }
    // Only the CAS winner reaches this point, so the cell is still empty.
    let _ = self.value.set(value);

    let callbacks = {
      let mut callbacks = self.callbacks.lock();
      self.state.store(DONE, Ordering::Release);
      std::mem::take(&mut *callbacks)
    };
    self.notify.notify_waiters();

    if let Some(value) = self.value.get() {
      for callback in callbacks {
        run_callback(callback, value);
      }
    }
    true
  }

  pub(crate) fn is_set(&self) -> bool {
    self.state.load(Ordering::Acquire) == DONE
  }

  /// Runs `callback` with the value once it is recorded; immediately if it already is.
  pub(crate) fn on_set(&self, callback: impl FnOnce(&V) + Send + 'static) {
    {
      let mut callbacks = self.callbacks.lock();
      if !self.is_set() {
        callbacks.push(Box::new(callback));
        return;
      }
    }
    if let Some(value) = self.value.get() {
      run_callback(callback, value);
    }
  }

  pub(crate) fn get_ref(&self) -> Option<&V> {
    if self.is_set() {
      self.value.get()
    } else {
      None
    }
  }
}

/// A panicking callback must not starve the ones registered after it.
fn run_callback<V>(callback: impl FnOnce(&V), value: &V) {
  if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
    error!("A completion callback panicked; remaining callbacks still run.");
  }
}

impl<V: Clone> WriteOnce<V> {
  pub(crate) fn get(&self) -> Option<V> {
    self.get_ref().cloned()
  }

  pub(crate) async fn wait(&self) -> V {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(value) = self.get() {
        return value;
      }
      notified.await;
    }
  }
}

impl<V> fmt::Debug for WriteOnce<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pending_callbacks = self.callbacks.try_lock().map_or(0, |callbacks| callbacks.len());
    f.debug_struct("WriteOnce")
      .field("done", &self.is_set())
      .field("pending_callbacks", &pending_callbacks)
      .finish()
  }
}
