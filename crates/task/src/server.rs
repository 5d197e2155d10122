//! Request submission front ends.
//!
//! [`DataServer`] owns the worker pool, merges request defaults and spawns a
//! [`RequestTask`] per request. [`Service`] pins the request to one named
//! service.

use crate::remote::{Credentials, RemoteClient};
use crate::task::{Launch, RequestTask, StatusObserver};
use datafetch_core::{
    LineParser, ProgressParser, RequestDescription, Result, Router, SERVICE_FIELD, TARGET_FIELD,
};
use datafetch_pool::{PoolConfig, PoolWarning, WorkerPool};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Data server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Requests executed concurrently
    pub max_workers: usize,
    /// Fields merged into every request
    pub defaults: RequestDescription,
    /// Mirror each task's messages to `<target>.log`
    pub write_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_workers: 1,
            defaults: RequestDescription::new(),
            write_logs: true,
        }
    }
}

/// Submits requests to the remote service on a bounded pool.
///
/// Dropping the server waits for every submitted request.
pub struct DataServer {
    pool: WorkerPool,
    warnings: Vec<PoolWarning>,
    defaults: RequestDescription,
    router: Router,
    launch: Launch,
}

impl DataServer {
    /// Start the worker pool.
    ///
    /// Advisory pool warnings are logged and kept for [`DataServer::warnings`].
    pub fn new(
        config: ServerConfig,
        credentials: Credentials,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Self> {
        let (pool, warnings) = WorkerPool::new(PoolConfig::default().with_workers(config.max_workers))?;
        for warning in &warnings {
            warn!("{}", warning);
        }
        debug!(
            workers = config.max_workers,
            write_logs = config.write_logs,
            url = %credentials.url,
            "Data server ready"
        );

        Ok(Self {
            pool,
            warnings,
            defaults: config.defaults,
            router: Router::new(),
            launch: Launch {
                client,
                credentials: Arc::new(credentials),
                parser: Arc::new(LineParser::new()),
                write_logs: config.write_logs,
            },
        })
    }

    /// Use a different progress-line dialect for tasks spawned from now on.
    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.launch.parser = parser;
        self
    }

    /// Warnings produced when the pool was configured.
    pub fn warnings(&self) -> &[PoolWarning] {
        &self.warnings
    }

    /// Request template merged under every request.
    pub fn defaults(&self) -> &RequestDescription {
        &self.defaults
    }

    /// Submit `request` and return the task tracking it.
    ///
    /// Fails immediately with a configuration error if the merged request
    /// has no usable address or target.
    pub fn retrieve(&self, request: RequestDescription) -> Result<RequestTask> {
        self.submit(request, None)
    }

    /// Like [`DataServer::retrieve`], registering `callback` before the
    /// request can make progress.
    pub fn retrieve_with<F>(&self, request: RequestDescription, callback: F) -> Result<RequestTask>
    where
        F: Fn(&RequestTask) + Send + Sync + 'static,
    {
        self.submit(request, Some(Arc::new(callback)))
    }

    /// Like [`DataServer::retrieve`] with a shared observer.
    pub fn retrieve_observed(
        &self,
        request: RequestDescription,
        observer: Arc<dyn StatusObserver>,
    ) -> Result<RequestTask> {
        self.submit(request, Some(observer))
    }

    fn submit(
        &self,
        request: RequestDescription,
        observer: Option<Arc<dyn StatusObserver>>,
    ) -> Result<RequestTask> {
        let merged = RequestDescription::merged(&self.defaults, &request);
        let resolved = self.router.resolve(merged)?;
        RequestTask::spawn(&self.pool, resolved, self.launch.clone(), observer)
    }

    /// Stop accepting requests. With `wait`, block until all have finished.
    pub fn shutdown(&self, wait: bool) {
        self.pool.shutdown(wait);
    }

    /// Number of concurrent requests.
    pub fn max_workers(&self) -> usize {
        self.pool.max_workers()
    }
}

/// A [`DataServer`] bound to one named service, such as `mars`.
pub struct Service {
    name: String,
    server: DataServer,
}

impl Service {
    /// Start a server whose requests all go to `services/<name>`.
    pub fn new(
        name: impl Into<String>,
        mut config: ServerConfig,
        credentials: Credentials,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        config.defaults.insert(SERVICE_FIELD, name.clone());
        Ok(Self {
            name,
            server: DataServer::new(config, credentials, client)?,
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit `request`, writing the result to `target` when given.
    pub fn execute(&self, request: RequestDescription, target: Option<&Path>) -> Result<RequestTask> {
        self.server.retrieve(with_target(request, target))
    }

    /// Like [`Service::execute`], registering `callback` first.
    pub fn execute_with<F>(
        &self,
        request: RequestDescription,
        target: Option<&Path>,
        callback: F,
    ) -> Result<RequestTask>
    where
        F: Fn(&RequestTask) + Send + Sync + 'static,
    {
        self.server.retrieve_with(with_target(request, target), callback)
    }

    /// Underlying data server.
    pub fn server(&self) -> &DataServer {
        &self.server
    }

    /// See [`DataServer::shutdown`].
    pub fn shutdown(&self, wait: bool) {
        self.server.shutdown(wait);
    }
}

fn with_target(mut request: RequestDescription, target: Option<&Path>) -> RequestDescription {
    if let Some(target) = target {
        request.insert(TARGET_FIELD, target.to_string_lossy().into_owned());
    }
    request
}
