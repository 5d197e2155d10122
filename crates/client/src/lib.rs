//! Web API collaborator for datafetch.
//!
//! [`WebApiClient`] performs requests against the remote data retrieval
//! service over HTTP and [`resolve`] finds the account credentials to use.

#![warn(missing_docs)]

pub mod credentials;
pub mod http;

pub use credentials::{read_rc_file, resolve, resolve_with, ExplicitCredentials};
pub use http::{requests_url, WebApiClient, DEFAULT_RETRY_AFTER, DEFAULT_TIMEOUT};
