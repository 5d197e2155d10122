//! Observable request tasks.
//!
//! A [`DataServer`] turns request descriptions into [`RequestTask`]s running
//! on a bounded worker pool. Each task follows the progress the remote
//! service reports, notifies its observers on every status change and keeps
//! a journal of its lifecycle, optionally mirrored to `<target>.log`.
//!
//! ```no_run
//! use datafetch_core::RequestDescription;
//! use datafetch_task::{wait, Credentials, DataServer, RemoteClient, ReturnWhen, ServerConfig};
//! use std::sync::Arc;
//!
//! # fn run(client: Arc<dyn RemoteClient>) -> datafetch_core::Result<()> {
//! let server = DataServer::new(
//!     ServerConfig::default(),
//!     Credentials::new("https://api.example.com/v1", "key", "me@example.com"),
//!     client,
//! )?;
//! let task = server.retrieve_with(
//!     RequestDescription::new().with("dataset", "interim").with("target", "out.grib"),
//!     |task| println!("{} is now {}", task.target().display(), task.status()),
//! )?;
//! wait([&task], None, ReturnWhen::AllCompleted);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod combinators;
pub mod journal;
pub mod remote;
pub mod server;
pub mod task;

pub use combinators::{as_completed, wait, AsCompleted, TaskRegistry, WaitResult};
pub use datafetch_pool::ReturnWhen;
pub use journal::{log_path_for, Journal};
pub use remote::{Credentials, RemoteCall, RemoteClient, ResultMetadata};
pub use server::{DataServer, ServerConfig, Service};
pub use task::{RequestTask, StatusObserver};
