//! datafetch core model.
//!
//! This crate defines the pieces every other datafetch crate shares: the
//! error type, the request status state machine, progress-line parsing and
//! the routing of request descriptions to remote service addresses.

#![warn(missing_docs)]

// Identities
mod id;

// Errors
mod error;

// State machine and its inputs
mod status;
mod progress;

// Requests and routing
mod request;

// Re-exports
pub use id::*;

pub use error::{FetchError, RemoteError, Result};
pub use status::{Effect, FinishKind, RequestStatus, Step, TaskState, UnknownStatus};
pub use progress::{LineParser, ProgressEvent, ProgressParser};
pub use request::{
    RequestDescription, ResolvedRequest, Router, ServiceAddress,
    DATASET_FIELD, SERVICE_FIELD, TARGET_FIELD,
};
