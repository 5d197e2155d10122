//! Waiting on groups of tasks.

use crate::task::RequestTask;
use datafetch_core::{HandleId, Result};
use datafetch_pool::{waiter, CompletionStream, Handle, ReturnWhen};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// One-shot lookup from execution handles back to the tasks owning them.
///
/// Built once per combinator call. Duplicate tasks collapse to one entry;
/// the first occurrence fixes the order.
pub struct TaskRegistry {
    order: Vec<HandleId>,
    tasks: HashMap<HandleId, RequestTask>,
}

impl TaskRegistry {
    /// Index `tasks` by the id of their handle.
    pub fn new<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a RequestTask>,
    {
        let mut order = Vec::new();
        let mut by_handle = HashMap::new();
        for task in tasks {
            let id = task.handle().id();
            if by_handle.insert(id, task.clone()).is_none() {
                order.push(id);
            }
        }
        Self {
            order,
            tasks: by_handle,
        }
    }

    /// Task owning the handle `id`.
    pub fn get(&self, id: HandleId) -> Option<&RequestTask> {
        self.tasks.get(&id)
    }

    /// Handles in registration order.
    pub fn handles(&self) -> Vec<Handle<Value>> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|task| task.handle().clone())
            .collect()
    }

    /// Number of distinct tasks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn take(&mut self, id: HandleId) -> Option<RequestTask> {
        self.tasks.remove(&id)
    }
}

/// Tasks partitioned by [`wait`].
#[derive(Debug, Default)]
pub struct WaitResult {
    /// Finished tasks
    pub done: HashSet<RequestTask>,
    /// Tasks still pending or running
    pub not_done: HashSet<RequestTask>,
}

/// Block until `when` is satisfied or `timeout` elapses, then partition
/// `tasks` into done and not done.
pub fn wait<'a, I>(tasks: I, timeout: Option<Duration>, when: ReturnWhen) -> WaitResult
where
    I: IntoIterator<Item = &'a RequestTask>,
{
    let registry = TaskRegistry::new(tasks);
    let outcome = waiter::wait(&registry.handles(), timeout, when);

    let collect = |ids: Vec<HandleId>| -> HashSet<RequestTask> {
        ids.into_iter()
            .filter_map(|id| registry.get(id).cloned())
            .collect()
    };
    WaitResult {
        done: collect(outcome.done),
        not_done: collect(outcome.not_done),
    }
}

/// Iterate over `tasks` in the order they finish.
pub fn as_completed<'a, I>(tasks: I) -> AsCompleted
where
    I: IntoIterator<Item = &'a RequestTask>,
{
    let registry = TaskRegistry::new(tasks);
    let stream = CompletionStream::new(registry.handles());
    AsCompleted { registry, stream }
}

/// Iterator returned by [`as_completed`].
///
/// Tasks already finished come first. Each task is yielded once and the
/// iterator cannot be restarted.
pub struct AsCompleted {
    registry: TaskRegistry,
    stream: CompletionStream<Handle<Value>>,
}

impl AsCompleted {
    /// Next finished task, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when every task has been yielded and
    /// [`datafetch_core::FetchError::Timeout`] when none finished in time.
    pub fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<RequestTask>> {
        while let Some(id) = self.stream.next_timeout(timeout)? {
            if let Some(task) = self.registry.take(id) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Number of tasks not yet yielded.
    pub fn remaining(&self) -> usize {
        self.stream.remaining()
    }
}

impl Iterator for AsCompleted {
    type Item = RequestTask;

    fn next(&mut self) -> Option<RequestTask> {
        self.next_timeout(None).ok().flatten()
    }
}
