//! Observable request tasks.
//!
//! A [`RequestTask`] tracks one remote request executing on a worker thread.
//! Progress lines from the remote collaborator drive the pure state machine
//! in `datafetch_core`; this module applies the resulting effects, notifies
//! observers and finalizes the task exactly once when its work item ends.

use crate::journal::Journal;
use crate::remote::{result_messages, Credentials, RemoteCall, RemoteClient, ResultMetadata};
use chrono::{DateTime, Utc};
use datafetch_core::{
    Effect, FetchError, ProgressParser, RequestStatus, ResolvedRequest, Result, ServiceAddress,
    Step, TaskKey, TaskState,
};
use datafetch_pool::{Handle, Outcome, WorkerPool};
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Receives every status transition of a task.
///
/// Observers run synchronously on the thread that caused the transition,
/// usually a pool worker. They must be quick and must not wait for work on
/// the same pool.
pub trait StatusObserver: Send + Sync {
    /// Called after the status of `task` changed.
    fn status_changed(&self, task: &RequestTask);
}

impl<F> StatusObserver for F
where
    F: Fn(&RequestTask) + Send + Sync,
{
    fn status_changed(&self, task: &RequestTask) {
        self(task)
    }
}

enum ObserverSlot {
    Strong(Arc<dyn StatusObserver>),
    Weak(Weak<dyn StatusObserver>),
}

impl ObserverSlot {
    fn live(&self) -> Option<Arc<dyn StatusObserver>> {
        match self {
            ObserverSlot::Strong(observer) => Some(Arc::clone(observer)),
            ObserverSlot::Weak(observer) => observer.upgrade(),
        }
    }
}

/// Everything a task needs besides its request.
#[derive(Clone)]
pub(crate) struct Launch {
    pub client: Arc<dyn RemoteClient>,
    pub credentials: Arc<Credentials>,
    pub parser: Arc<dyn ProgressParser>,
    pub write_logs: bool,
}

struct Progress {
    state: TaskState,
    end_time: Option<DateTime<Utc>>,
    end_elapsed: Option<Duration>,
    metadata: ResultMetadata,
    elapsed_log: Vec<(RequestStatus, Duration)>,
    journal: Journal,
    observers: Vec<ObserverSlot>,
    finalized: bool,
}

impl Progress {
    /// Apply a step. Returns whether the status changed.
    fn apply(&mut self, key: TaskKey, step: Step, elapsed: Duration) -> bool {
        self.state = step.next;
        let mut transitioned = false;
        for effect in step.effects {
            match effect {
                Effect::Transition(status) => {
                    debug!(task = %key, status = %status, "Status changed");
                    self.elapsed_log.push((status, elapsed));
                    transitioned = true;
                }
                Effect::AssignId(id) => {
                    debug!(task = %key, id = %id, "Server assigned request id");
                }
                Effect::Log(line) => self.journal.write_line(line),
            }
        }
        transitioned
    }

    fn live_observers(&mut self) -> Vec<Arc<dyn StatusObserver>> {
        self.observers.retain(|slot| match slot {
            ObserverSlot::Weak(observer) => observer.strong_count() > 0,
            ObserverSlot::Strong(_) => true,
        });
        self.observers.iter().filter_map(ObserverSlot::live).collect()
    }
}

struct TaskInner {
    key: TaskKey,
    address: ServiceAddress,
    target: PathBuf,
    payload: Map<String, Value>,
    start_time: DateTime<Utc>,
    started: Instant,
    parser: Arc<dyn ProgressParser>,
    handle: Handle<Value>,
    progress: Mutex<Progress>,
}

/// A remote request running on a worker pool.
///
/// Clones share the same task. Equality and hashing use the local
/// [`TaskKey`], so tasks can be kept in sets.
#[derive(Clone)]
pub struct RequestTask {
    inner: Arc<TaskInner>,
}

impl RequestTask {
    /// Create a task for `request` and queue its work on `pool`.
    ///
    /// `observer`, if given, is registered before the work is queued so it
    /// sees every transition.
    pub(crate) fn spawn(
        pool: &WorkerPool,
        request: ResolvedRequest,
        launch: Launch,
        observer: Option<Arc<dyn StatusObserver>>,
    ) -> Result<RequestTask> {
        let mut created = None;
        pool.submit_with(|handle: &Handle<Value>| {
            let task = RequestTask::new(request, handle.clone(), &launch);
            if let Some(observer) = observer {
                task.lock().observers.push(ObserverSlot::Strong(observer));
            }

            // The handle drops its callbacks once they ran, which releases
            // this clone even when the caller let go of the task.
            let finalizer = task.clone();
            handle.on_done(move |outcome| finalizer.finalize(outcome));

            created = Some(task.clone());
            move || task.execute(launch.client.as_ref(), &launch.credentials)
        })?;

        created.ok_or(FetchError::PoolShutdown)
    }

    fn new(request: ResolvedRequest, handle: Handle<Value>, launch: &Launch) -> Self {
        let journal = if launch.write_logs {
            Journal::persistent(&request.target)
        } else {
            Journal::in_memory()
        };
        let key = TaskKey::new();
        debug!(task = %key, address = %request.address, target = %request.target.display(), "Created request task");

        Self {
            inner: Arc::new(TaskInner {
                key,
                address: request.address,
                target: request.target,
                payload: request.payload,
                start_time: Utc::now(),
                started: Instant::now(),
                parser: Arc::clone(&launch.parser),
                handle,
                progress: Mutex::new(Progress {
                    state: TaskState::default(),
                    end_time: None,
                    end_elapsed: None,
                    metadata: ResultMetadata::default(),
                    elapsed_log: Vec::new(),
                    journal,
                    observers: Vec::new(),
                    finalized: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of the work item, run on a pool worker.
    fn execute(&self, client: &dyn RemoteClient, credentials: &Credentials) -> Result<Value> {
        {
            let mut progress = self.lock();
            progress.journal.open()?;
            progress
                .journal
                .request_section(&self.inner.address, &self.inner.target, &self.inner.payload);
            progress.journal.server_section();
        }

        let call = RemoteCall {
            address: &self.inner.address,
            credentials,
            payload: &self.inner.payload,
            target: &self.inner.target,
        };
        let mut on_line = |line: &str| self.receive(line);
        Ok(client.execute(call, &mut on_line)?)
    }

    /// Feed one progress line from the remote collaborator.
    fn receive(&self, line: &str) {
        let event = self.inner.parser.parse(line);
        let observers = {
            let mut progress = self.lock();
            let step = progress.state.on_progress(&event);
            if progress.apply(self.inner.key, step, self.inner.started.elapsed()) {
                progress.live_observers()
            } else {
                Vec::new()
            }
        };
        self.notify(&observers);
    }

    /// Settle the task once its work item ended, by any outcome.
    fn finalize(&self, outcome: &Outcome<Value>) {
        let observers = {
            let mut guard = self.lock();
            let progress = &mut *guard;
            if progress.finalized {
                return;
            }
            progress.finalized = true;

            let elapsed = self.inner.started.elapsed();
            progress.end_time = Some(offset_time(self.inner.start_time, elapsed));
            progress.end_elapsed = Some(elapsed);

            let step = progress.state.on_finish(outcome.finish_kind());
            let transitioned = progress.apply(self.inner.key, step, elapsed);

            match outcome {
                Outcome::Completed(payload) => {
                    let metadata = ResultMetadata::from_payload(payload);
                    let messages = result_messages(payload);
                    progress.journal.result_sections(messages.as_deref(), &metadata);
                    info!(
                        task = %self.inner.key,
                        target = %self.inner.target.display(),
                        size = ?metadata.size,
                        "Request complete"
                    );
                    progress.metadata = metadata;
                }
                Outcome::Failed(err) => {
                    progress.journal.error_section(err);
                    warn!(
                        task = %self.inner.key,
                        target = %self.inner.target.display(),
                        "Request failed: {}",
                        err
                    );
                }
                Outcome::Cancelled => {
                    warn!(
                        task = %self.inner.key,
                        target = %self.inner.target.display(),
                        "Request cancelled"
                    );
                }
            }

            progress.journal.elapsed_section(&progress.elapsed_log);
            progress.journal.close();

            if transitioned {
                progress.live_observers()
            } else {
                Vec::new()
            }
        };
        self.notify(&observers);
    }

    fn notify(&self, observers: &[Arc<dyn StatusObserver>]) {
        for observer in observers {
            observer.status_changed(self);
        }
    }

    /// Local identity.
    pub fn key(&self) -> TaskKey {
        self.inner.key
    }

    /// Server-assigned id, once reported.
    pub fn id(&self) -> Option<String> {
        self.lock().state.id.clone()
    }

    /// Current status.
    pub fn status(&self) -> RequestStatus {
        self.lock().state.status
    }

    /// Local destination of the result.
    pub fn target(&self) -> &Path {
        &self.inner.target
    }

    /// Remote address the request is sent to.
    pub fn address(&self) -> &ServiceAddress {
        &self.inner.address
    }

    /// Body sent to the server.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.inner.payload
    }

    /// When the task was created.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    /// When the task was finalized.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.lock().end_time
    }

    /// Time from creation to finalization, or until now if still running.
    pub fn elapsed(&self) -> Duration {
        self.lock()
            .end_elapsed
            .unwrap_or_else(|| self.inner.started.elapsed())
    }

    /// Result metadata, populated when the request completed.
    pub fn metadata(&self) -> ResultMetadata {
        self.lock().metadata.clone()
    }

    /// Download location of the result.
    pub fn href(&self) -> Option<String> {
        self.lock().metadata.href.clone()
    }

    /// Size of the result in bytes.
    pub fn size(&self) -> Option<u64> {
        self.lock().metadata.size
    }

    /// Content type of the result.
    pub fn kind(&self) -> Option<String> {
        self.lock().metadata.kind.clone()
    }

    /// Message log so far.
    pub fn messages(&self) -> Vec<String> {
        self.lock().journal.messages().to_vec()
    }

    /// Every status transition with the time it took to get there.
    pub fn elapsed_log(&self) -> Vec<(RequestStatus, Duration)> {
        self.lock().elapsed_log.clone()
    }

    /// Log file path, when logs are written.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.lock().journal.path().map(Path::to_path_buf)
    }

    /// Call `callback` on every later status transition.
    ///
    /// Callbacks run in registration order. Registering on a finished task
    /// is allowed but the callback is never called.
    pub fn add_status_callback<F>(&self, callback: F)
    where
        F: Fn(&RequestTask) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(callback));
    }

    /// Register a shared observer.
    pub fn add_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.lock().observers.push(ObserverSlot::Strong(observer));
    }

    /// Register an observer without keeping it alive.
    ///
    /// The observer is skipped once dropped. Fails with
    /// [`FetchError::InvalidArgument`] if it is already gone.
    pub fn add_weak_observer(&self, observer: Weak<dyn StatusObserver>) -> Result<()> {
        if observer.strong_count() == 0 {
            return Err(FetchError::InvalidArgument(
                "status observer is no longer alive".to_string(),
            ));
        }
        self.lock().observers.push(ObserverSlot::Weak(observer));
        Ok(())
    }

    /// Cancel the task if it has not started yet.
    ///
    /// Only the local work item is cancelled; a request already sent to the
    /// server keeps running there. Returns whether the task is cancelled.
    pub fn cancel(&self) -> bool {
        self.inner.handle.cancel()
    }

    /// Whether the task was cancelled.
    pub fn cancelled(&self) -> bool {
        self.inner.handle.cancelled()
    }

    /// Whether the task is executing on a worker.
    pub fn running(&self) -> bool {
        self.inner.handle.running()
    }

    /// Whether the task finished and was finalized.
    pub fn done(&self) -> bool {
        self.inner.handle.done()
    }

    /// Block until finished or `timeout` elapses. Returns whether it finished.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.inner.handle.wait(timeout)
    }

    /// Block until finished and return the result payload.
    ///
    /// Fails with the task's error, [`FetchError::Cancelled`] or
    /// [`FetchError::Timeout`].
    pub fn result(&self, timeout: Option<Duration>) -> Result<Value> {
        self.inner.handle.result(timeout)
    }

    /// Block until finished and return the error the task failed with.
    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<FetchError>> {
        self.inner.handle.error(timeout)
    }

    pub(crate) fn handle(&self) -> &Handle<Value> {
        &self.inner.handle
    }
}

fn offset_time(start_time: DateTime<Utc>, elapsed: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|elapsed| start_time.checked_add_signed(elapsed))
        .unwrap_or(start_time)
}

impl PartialEq for RequestTask {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for RequestTask {}

impl Hash for RequestTask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl std::fmt::Display for RequestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (id, status) = {
            let progress = self.lock();
            (progress.state.id.clone(), progress.state.status)
        };
        write!(
            f,
            "<RequestTask id={} target={} status={} elapsed={:.2}min>",
            id.as_deref().unwrap_or("none"),
            self.inner.target.display(),
            status,
            crate::journal::minutes(self.elapsed())
        )
    }
}

impl std::fmt::Debug for RequestTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTask")
            .field("key", &self.inner.key)
            .field("address", &self.inner.address)
            .field("target", &self.inner.target)
            .field("status", &self.status())
            .finish()
    }
}
