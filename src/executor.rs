use crate::error::PoolError;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;

/// A unit of work handed to an [`Executor`].
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs units of work asynchronously, respecting its own concurrency limits.
///
/// `execute` must not block the caller: it only admits the work.
pub trait Executor: Send + Sync {
  fn execute(&self, work: Work) -> Result<(), PoolError>;
}

/// Spawns every unit of work straight onto the Tokio runtime, without a limit.
impl Executor for TokioHandle {
  fn execute(&self, work: Work) -> Result<(), PoolError> {
    self.spawn(work);
    Ok(())
  }
}

impl<X: Executor + ?Sized> Executor for Arc<X> {
  fn execute(&self, work: Work) -> Result<(), PoolError> {
    (**self).execute(work)
  }
}
