//! Waiting on many handles at once.
//!
//! A [`Waiter`] is attached to every pending handle of a group; each handle
//! pushes its id into the waiter when it settles. [`wait`] and
//! [`CompletionStream`] are built on top of that.

use datafetch_core::{FetchError, HandleId, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Something that finishes once and can wake a [`Waiter`] when it does.
pub trait Completion: Send + Sync {
    /// Identity used to report completion.
    fn handle_id(&self) -> HandleId;

    /// Whether it finished.
    fn is_done(&self) -> bool;

    /// Whether it finished with an error.
    fn is_failed(&self) -> bool;

    /// Notify `waiter` on completion, immediately if already done.
    fn attach(&self, waiter: &Arc<Waiter>);

    /// Stop notifying `waiter`.
    fn detach(&self, waiter: &Arc<Waiter>);
}

/// Collects completion notifications in arrival order.
#[derive(Debug, Default)]
pub struct Waiter {
    finished: Mutex<VecDeque<(HandleId, bool)>>,
    arrived: Condvar,
}

impl Waiter {
    /// Create an empty waiter.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(HandleId, bool)>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `id` finished, and whether it failed.
    pub fn notify(&self, id: HandleId, failed: bool) {
        self.lock().push_back((id, failed));
        self.arrived.notify_all();
    }

    /// Take the oldest notification, blocking until one arrives or the
    /// deadline passes.
    pub fn next(&self, deadline: Option<Instant>) -> Option<(HandleId, bool)> {
        let mut finished = self.lock();
        loop {
            if let Some(entry) = finished.pop_front() {
                return Some(entry);
            }
            match deadline {
                None => {
                    finished = self
                        .arrived
                        .wait(finished)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .arrived
                        .wait_timeout(finished, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    finished = guard;
                }
            }
        }
    }
}

/// When [`wait`] should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnWhen {
    /// As soon as any handle finishes
    FirstCompleted,
    /// As soon as any handle fails, or when all finish
    FirstException,
    /// When every handle finishes
    #[default]
    AllCompleted,
}

impl ReturnWhen {
    fn satisfied(&self, done: usize, total: usize, failed: bool) -> bool {
        match self {
            ReturnWhen::FirstCompleted => done > 0 || total == 0,
            ReturnWhen::FirstException => failed || done == total,
            ReturnWhen::AllCompleted => done == total,
        }
    }
}

/// Partition of handle ids produced by [`wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Finished handles, in input order
    pub done: Vec<HandleId>,
    /// Unfinished handles, in input order
    pub not_done: Vec<HandleId>,
}

/// Block until `when` is satisfied or `timeout` elapses, then partition the
/// handles into done and not done. Duplicate handles are reported once.
pub fn wait<C: Completion>(handles: &[C], timeout: Option<Duration>, when: ReturnWhen) -> WaitOutcome {
    let deadline = timeout.map(|t| Instant::now() + t);

    let mut seen = HashSet::new();
    let unique: Vec<&C> = handles
        .iter()
        .filter(|h| seen.insert(h.handle_id()))
        .collect();

    let mut done: HashSet<HandleId> = unique
        .iter()
        .filter(|h| h.is_done())
        .map(|h| h.handle_id())
        .collect();
    let mut failed = unique.iter().any(|h| h.is_failed());

    if !when.satisfied(done.len(), unique.len(), failed) {
        let waiter = Arc::new(Waiter::new());
        let pending: Vec<&C> = unique
            .iter()
            .filter(|h| !done.contains(&h.handle_id()))
            .copied()
            .collect();
        for handle in &pending {
            handle.attach(&waiter);
        }

        while !when.satisfied(done.len(), unique.len(), failed) {
            match waiter.next(deadline) {
                Some((id, is_failed)) => {
                    done.insert(id);
                    failed |= is_failed;
                }
                None => break,
            }
        }

        for handle in &pending {
            handle.detach(&waiter);
        }
    }

    let mut outcome = WaitOutcome::default();
    for handle in unique {
        if handle.is_done() {
            outcome.done.push(handle.handle_id());
        } else {
            outcome.not_done.push(handle.handle_id());
        }
    }
    outcome
}

/// Yields handle ids in the order the handles finish.
///
/// Handles that were already finished when the stream was created come first,
/// in input order. The stream is finite and cannot be restarted.
pub struct CompletionStream<C: Completion> {
    ready: VecDeque<HandleId>,
    pending: HashMap<HandleId, C>,
    waiter: Arc<Waiter>,
}

impl<C: Completion> CompletionStream<C> {
    /// Start tracking `handles`. Duplicates are yielded once.
    pub fn new<I>(handles: I) -> Self
    where
        I: IntoIterator<Item = C>,
    {
        let waiter = Arc::new(Waiter::new());
        let mut ready = VecDeque::new();
        let mut pending = HashMap::new();
        let mut seen = HashSet::new();

        for handle in handles {
            let id = handle.handle_id();
            if !seen.insert(id) {
                continue;
            }
            if handle.is_done() {
                ready.push_back(id);
            } else {
                handle.attach(&waiter);
                pending.insert(id, handle);
            }
        }

        Self {
            ready,
            pending,
            waiter,
        }
    }

    /// Number of ids not yet yielded.
    pub fn remaining(&self) -> usize {
        self.ready.len() + self.pending.len()
    }

    /// Next finished id, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` once every handle has been yielded and
    /// [`FetchError::Timeout`] if nothing finished in time.
    pub fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<HandleId>> {
        if let Some(id) = self.ready.pop_front() {
            return Ok(Some(id));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.pending.is_empty() {
            match self.waiter.next(deadline) {
                Some((id, _)) => {
                    if self.pending.remove(&id).is_some() {
                        return Ok(Some(id));
                    }
                }
                None => return Err(FetchError::Timeout(timeout.unwrap_or_default())),
            }
        }
        Ok(None)
    }
}

impl<C: Completion> Iterator for CompletionStream<C> {
    type Item = HandleId;

    fn next(&mut self) -> Option<HandleId> {
        self.next_timeout(None).ok().flatten()
    }
}

impl<C: Completion> Drop for CompletionStream<C> {
    fn drop(&mut self) {
        for handle in self.pending.values() {
            handle.detach(&self.waiter);
        }
    }
}
