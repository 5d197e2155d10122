//! Fixed-size pool of worker threads.

use crate::config::{PoolConfig, PoolWarning};
use crate::handle::{panic_message, Handle, Outcome};
use datafetch_core::{FetchError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking work items on at most `max_workers` threads.
///
/// Work items wait in FIFO order for a free worker. Dropping the pool shuts it
/// down and waits for all outstanding work, so holding it in a scope
/// guarantees cleanup on every exit path, including unwinding.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Start the worker threads.
    ///
    /// Returns the pool together with the advisory warnings from
    /// [`PoolConfig::validate`]; the caller decides how to surface them.
    pub fn new(config: PoolConfig) -> Result<(Self, Vec<PoolWarning>)> {
        if config.max_workers == 0 {
            return Err(FetchError::InvalidArgument(
                "max_workers must be at least 1".to_string(),
            ));
        }
        let warnings = config.validate();

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let pool = Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::with_capacity(config.max_workers)),
            config,
        };

        debug!(
            workers = pool.config.max_workers,
            "Starting worker pool"
        );

        for i in 0..pool.config.max_workers {
            let receiver = Arc::clone(&receiver);
            let name = format!("{}-{}", pool.config.thread_name, i);
            let worker = thread::Builder::new()
                .name(name)
                .spawn(move || Self::worker_loop(receiver))?;
            pool.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker);
        }

        Ok((pool, warnings))
    }

    /// Run `f` with a fresh pool, shutting it down (and waiting) afterwards.
    pub fn scope<R, F>(config: PoolConfig, f: F) -> Result<R>
    where
        F: FnOnce(&WorkerPool) -> R,
    {
        let (pool, warnings) = Self::new(config)?;
        for warning in &warnings {
            warn!("{}", warning);
        }
        let result = f(&pool);
        pool.shutdown(true);
        Ok(result)
    }

    fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
        let name = thread::current().name().unwrap_or("worker").to_string();
        debug!(worker = %name, "Worker started");
        loop {
            let job = {
                let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                receiver.recv()
            };
            match job {
                Ok(job) => job(),
                Err(_) => break,
            }
        }
        debug!(worker = %name, "Worker stopped");
    }

    /// Queue `work` and return a handle to its eventual outcome.
    ///
    /// A panic inside `work` is recorded as [`FetchError::WorkerPanic`]; the
    /// worker thread survives it.
    pub fn submit<T, F>(&self, work: F) -> Result<Handle<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.submit_with(|_| work)
    }

    /// Like [`WorkerPool::submit`], but `build` sees the handle before the
    /// work item is queued.
    ///
    /// Completion callbacks registered inside `build` are therefore in place
    /// before the item can possibly finish. `build` is not called when the
    /// pool is already shut down, and must not submit to this pool itself.
    pub fn submit_with<T, B, F>(&self, build: B) -> Result<Handle<T>>
    where
        T: Send + Sync + 'static,
        B: FnOnce(&Handle<T>) -> F,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(FetchError::PoolShutdown);
        };

        let handle = Handle::new();
        let work = build(&handle);
        let job_handle = handle.clone();
        let job: Job = Box::new(move || {
            if !job_handle.start() {
                debug!(handle = %job_handle.id(), "Skipping cancelled work item");
                return;
            }
            let outcome = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(err)) => Outcome::Failed(err),
                Err(panic) => Outcome::Failed(FetchError::WorkerPanic(panic_message(panic.as_ref()))),
            };
            job_handle.finish(outcome);
        });

        if sender.send(job).is_err() {
            // Settle the handle so callbacks registered by `build` still run.
            handle.cancel();
            return Err(FetchError::PoolShutdown);
        }
        debug!(handle = %handle.id(), "Submitted work item");
        Ok(handle)
    }

    /// Stop accepting work. With `wait`, block until every queued and running
    /// item has finished.
    ///
    /// Calling this from a worker thread never joins that thread itself.
    pub fn shutdown(&self, wait: bool) {
        let closed = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            debug!("Worker pool shutting down");
        }
        if !wait {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Worker thread exited with a panic");
            }
        }
    }

    /// Whether [`WorkerPool::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Configured number of workers.
    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(PoolConfig::default().with_workers(workers)).unwrap().0
    }

    #[test]
    fn test_submit_returns_result() {
        let pool = pool(2);
        let handle = pool.submit(|| Ok(21 * 2)).unwrap();
        assert_eq!(handle.result(Some(Duration::from_secs(5))).unwrap(), 42);
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let err = WorkerPool::new(PoolConfig::default().with_workers(0)).err().unwrap();
        assert!(matches!(err, FetchError::InvalidArgument(_)));
    }

    #[test]
    fn test_construction_reports_warnings() {
        let (_pool, warnings) = WorkerPool::new(PoolConfig::default().with_workers(4)).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_errors_and_panics_are_captured() {
        let pool = pool(1);
        let failing = pool
            .submit::<u32, _>(|| Err(FetchError::Configuration("nope".to_string())))
            .unwrap();
        let panicking = pool.submit::<u32, _>(|| panic!("boom")).unwrap();
        let after = pool.submit(|| Ok(1u32)).unwrap();

        assert!(matches!(failing.result(None), Err(FetchError::Configuration(_))));
        assert!(matches!(
            panicking.result(None),
            Err(FetchError::WorkerPanic(ref msg)) if msg == "boom"
        ));
        assert_eq!(after.result(None).unwrap(), 1);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let pool = pool(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                pool.submit(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.result(None).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_queue_is_fifo() {
        let pool = pool(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                pool.submit(move || {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait(None);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancelled_item_never_runs() {
        let pool = pool(1);
        let (release, gate) = mpsc::channel::<()>();
        let blocker = pool
            .submit(move || {
                let _ = gate.recv();
                Ok(())
            })
            .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let queued = pool
            .submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(queued.cancel());
        release.send(()).unwrap();
        blocker.wait(None);
        pool.shutdown(true);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(queued.cancelled());
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = pool(1);
        pool.shutdown(true);
        assert!(pool.is_shutdown());
        assert!(matches!(pool.submit(|| Ok(())), Err(FetchError::PoolShutdown)));
    }

    #[test]
    fn test_shutdown_waits_for_queued_work() {
        let done = Arc::new(AtomicUsize::new(0));
        WorkerPool::scope(PoolConfig::default().with_workers(2), |pool| {
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(10));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }
        })
        .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
