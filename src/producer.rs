use crate::task::Task;

/// A pull-based, lazily evaluated, single-use source of tasks.
///
/// Each call to `next_task` creates (and thereby submits) at most one task.
/// `None` means the producer is exhausted; `Some(Err(_))` means pulling failed.
/// Implementations must not create tasks ahead of being asked for them, or the
/// windowing guarantee of the chain is lost.
pub trait TaskProducer<T, E> {
  fn next_task(&mut self) -> Option<Result<Task<T, E>, E>>;
}

impl<I, T, E> TaskProducer<T, E> for I
where
  I: Iterator<Item = Result<Task<T, E>, E>>,
{
  fn next_task(&mut self) -> Option<Result<Task<T, E>, E>> {
    self.next()
  }
}

/// Adapts an iterator whose pulls cannot fail into a [`TaskProducer`].
pub fn infallible<I, T, E>(tasks: I) -> impl Iterator<Item = Result<Task<T, E>, E>>
where
  I: IntoIterator<Item = Task<T, E>>,
{
  tasks.into_iter().map(Ok)
}
