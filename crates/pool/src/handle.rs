//! Completion handles for submitted work.

use crate::waiter::{Completion, Waiter};
use datafetch_core::{FetchError, FinishKind, HandleId, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::error;

/// How a work item ended.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Returned a value
    Completed(T),
    /// Returned an error or panicked
    Failed(FetchError),
    /// Cancelled before it started
    Cancelled,
}

impl<T> Outcome<T> {
    /// Whether the work item failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Whether the work item was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// The error, if the work item failed.
    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Classification used by the status state machine.
    pub fn finish_kind(&self) -> FinishKind {
        match self {
            Outcome::Completed(_) => FinishKind::Completed,
            Outcome::Failed(_) => FinishKind::Failed,
            Outcome::Cancelled => FinishKind::Cancelled,
        }
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum Phase<T> {
    Pending,
    Running,
    Finished(Arc<Outcome<T>>),
}

struct State<T> {
    phase: Phase<T>,
    // Set once every completion callback has returned.
    settled: bool,
    // Thread running the completion callbacks, until they return.
    finisher: Option<ThreadId>,
    callbacks: Vec<DoneCallback<T>>,
    waiters: Vec<Arc<Waiter>>,
}

impl<T> State<T> {
    /// Whether a caller on this thread may see the outcome.
    fn ready(&self) -> bool {
        self.settled || self.finisher == Some(thread::current().id())
    }
}

struct Shared<T> {
    id: HandleId,
    state: Mutex<State<T>>,
    settled: Condvar,
}

/// Handle to one submitted work item.
///
/// Cloning is cheap; every clone refers to the same work item. A handle is
/// *done* only after its completion callbacks have run, so anyone woken by
/// [`Handle::wait`] or a [`Waiter`] sees the effects of those callbacks.
pub struct Handle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.shared.id).finish()
    }
}

impl<T: Send + Sync + 'static> Handle<T> {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: HandleId::new(),
                state: Mutex::new(State {
                    phase: Phase::Pending,
                    settled: false,
                    finisher: None,
                    callbacks: Vec::new(),
                    waiters: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Identity of this work item.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from pending to running. Returns false if the item was cancelled.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.lock();
        match state.phase {
            Phase::Pending => {
                state.phase = Phase::Running;
                true
            }
            _ => false,
        }
    }

    /// Record the outcome, run completion callbacks, then release waiters.
    pub(crate) fn finish(&self, outcome: Outcome<T>) {
        let outcome = Arc::new(outcome);
        let callbacks = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Finished(_)) {
                return;
            }
            state.phase = Phase::Finished(Arc::clone(&outcome));
            state.finisher = Some(thread::current().id());
            std::mem::take(&mut state.callbacks)
        };
        self.run_callbacks(callbacks, &outcome);
        self.settle(&outcome);
    }

    /// Cancel the work item if it has not started.
    ///
    /// Returns true if the item is (now) cancelled. Work that is already
    /// running or finished is left alone and false is returned.
    pub fn cancel(&self) -> bool {
        let outcome = Arc::new(Outcome::Cancelled);
        let callbacks = {
            let mut state = self.lock();
            match &state.phase {
                Phase::Pending => {}
                Phase::Finished(existing) => return existing.is_cancelled(),
                Phase::Running => return false,
            }
            state.phase = Phase::Finished(Arc::clone(&outcome));
            state.finisher = Some(thread::current().id());
            std::mem::take(&mut state.callbacks)
        };
        self.run_callbacks(callbacks, &outcome);
        self.settle(&outcome);
        true
    }

    fn settle(&self, outcome: &Outcome<T>) {
        let waiters = {
            let mut state = self.lock();
            state.settled = true;
            state.finisher = None;
            std::mem::take(&mut state.waiters)
        };
        self.shared.settled.notify_all();
        for waiter in waiters {
            waiter.notify(self.shared.id, outcome.is_failed());
        }
    }

    fn run_callbacks(&self, callbacks: Vec<DoneCallback<T>>, outcome: &Outcome<T>) {
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                error!(
                    handle = %self.shared.id,
                    "completion callback panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Run `callback` once the work item finishes.
    ///
    /// Callbacks run in registration order on the thread that finishes the
    /// item. If it already finished, `callback` runs immediately on the
    /// calling thread.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.lock();
            let finished = match &state.phase {
                Phase::Finished(outcome) => Some(Arc::clone(outcome)),
                _ => None,
            };
            match finished {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        self.run_callbacks(vec![Box::new(callback)], &outcome);
    }

    /// Whether the item was cancelled.
    pub fn cancelled(&self) -> bool {
        matches!(&self.lock().phase, Phase::Finished(outcome) if outcome.is_cancelled())
    }

    /// Whether the item is executing on a worker.
    pub fn running(&self) -> bool {
        matches!(self.lock().phase, Phase::Running)
    }

    /// Whether the item finished and its completion callbacks returned.
    pub fn done(&self) -> bool {
        self.lock().settled
    }

    fn wait_settled(&self, timeout: Option<Duration>) -> MutexGuard<'_, State<T>> {
        let mut state = self.lock();
        match timeout {
            None => {
                while !state.ready() {
                    state = self
                        .shared
                        .settled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.ready() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = self
                        .shared
                        .settled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
        state
    }

    /// Block until done or `timeout` elapses. Returns whether it is done.
    ///
    /// Called from a completion callback of this item, it returns true
    /// without waiting for the remaining callbacks.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.wait_settled(timeout).ready()
    }

    /// Block until done and return the outcome.
    pub fn outcome(&self, timeout: Option<Duration>) -> Result<Arc<Outcome<T>>> {
        let state = self.wait_settled(timeout);
        match &state.phase {
            Phase::Finished(outcome) if state.ready() => Ok(Arc::clone(outcome)),
            _ => Err(FetchError::Timeout(timeout.unwrap_or_default())),
        }
    }

    /// Block until done and return the value or the error.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T>
    where
        T: Clone,
    {
        match &*self.outcome(timeout)? {
            Outcome::Completed(value) => Ok(value.clone()),
            Outcome::Failed(err) => Err(err.clone()),
            Outcome::Cancelled => Err(FetchError::Cancelled),
        }
    }

    /// Block until done and return the error the item failed with, if any.
    pub fn error(&self, timeout: Option<Duration>) -> Result<Option<FetchError>> {
        match &*self.outcome(timeout)? {
            Outcome::Completed(_) => Ok(None),
            Outcome::Failed(err) => Ok(Some(err.clone())),
            Outcome::Cancelled => Err(FetchError::Cancelled),
        }
    }
}

impl<T: Send + Sync + 'static> Completion for Handle<T> {
    fn handle_id(&self) -> HandleId {
        self.shared.id
    }

    fn is_done(&self) -> bool {
        self.done()
    }

    fn is_failed(&self) -> bool {
        let state = self.lock();
        state.settled && matches!(&state.phase, Phase::Finished(outcome) if outcome.is_failed())
    }

    fn attach(&self, waiter: &Arc<Waiter>) {
        let failed = {
            let mut state = self.lock();
            if !state.settled {
                state.waiters.push(Arc::clone(waiter));
                return;
            }
            matches!(&state.phase, Phase::Finished(outcome) if outcome.is_failed())
        };
        waiter.notify(self.shared.id, failed);
    }

    fn detach(&self, waiter: &Arc<Waiter>) {
        self.lock().waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
