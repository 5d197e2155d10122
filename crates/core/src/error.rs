//! Error types shared by every datafetch crate.

use std::sync::Arc;
use std::time::Duration;

/// Error type for datafetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;

/// Errors that can occur while routing, running or querying requests.
///
/// The type is `Clone` because the outcome of a work item can be queried any
/// number of times; non-clonable sources are shared behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Ambiguous or missing service address, or an unusable request
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller-supplied argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking query exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The remote collaborator failed
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The work item was cancelled locally
    #[error("Request was cancelled")]
    Cancelled,

    /// The worker pool no longer accepts work
    #[error("Worker pool has been shut down")]
    PoolShutdown,

    /// The work item panicked on its worker thread
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Json(Arc::new(err))
    }
}

/// Failure reported by the remote service.
///
/// `details` holds whatever server-side messages could be recovered from the
/// transport, in the order the server sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Primary error message
    pub message: String,

    /// Server-side detail lines
    pub details: Vec<String>,
}

impl RemoteError {
    /// Create a remote error without details.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Attach server-side detail lines.
    pub fn with_details<I, S>(mut self, details: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details.extend(details.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for detail in &self.details {
            write!(f, "\n{}", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
