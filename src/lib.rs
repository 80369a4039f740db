//! A Tokio-based windowed chainer: runs a lazily produced sequence of
//! futures in windows of at most `parallel` concurrent tasks, never creating
//! a task of the next window before the current one has completed.

mod cell;
mod chain;
mod error;
mod executor;
mod pool;
pub mod producer;
mod signal;
mod task;

pub use chain::{chain_async, chain_async_with, chain_async_with_config, ChainConfig};
pub use error::{ChainError, PoolError, TaskError};
pub use executor::{Executor, Work};
pub use pool::{ShutdownMode, WorkerPool};
pub use producer::TaskProducer;
pub use signal::CompletionSignal;
pub use task::{spawn_task, Task, TaskOutcome};
