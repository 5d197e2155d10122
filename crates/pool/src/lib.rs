//! Bounded worker pool for blocking work.
//!
//! [`WorkerPool`] runs closures on a fixed number of threads and hands back a
//! [`Handle`] per submission. Handles can be waited on one at a time or in
//! groups through [`wait`] and [`CompletionStream`].

#![warn(missing_docs)]

pub mod config;
pub mod handle;
pub mod pool;
pub mod waiter;

pub use config::{PoolConfig, PoolWarning, REMOTE_CONCURRENCY_CAP};
pub use handle::{Handle, Outcome};
pub use pool::WorkerPool;
pub use waiter::{wait, Completion, CompletionStream, ReturnWhen, WaitOutcome, Waiter};
