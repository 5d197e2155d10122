//! The remote collaborator seam.
//!
//! A [`RemoteClient`] performs the whole blocking request / queue / execute /
//! download cycle and reports progress as free-text lines.

use datafetch_core::{RemoteError, ServiceAddress};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Account credentials for the remote service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// API endpoint
    pub url: String,
    /// API key
    pub key: String,
    /// Account identifier
    pub email: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(url: impl Into<String>, key: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            email: email.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("key", &"***")
            .field("email", &self.email)
            .finish()
    }
}

/// Everything a remote call needs.
#[derive(Debug, Clone, Copy)]
pub struct RemoteCall<'a> {
    /// Service to address
    pub address: &'a ServiceAddress,
    /// Account to use
    pub credentials: &'a Credentials,
    /// Request body
    pub payload: &'a Map<String, Value>,
    /// Local destination of the download
    pub target: &'a Path,
}

/// Performs a remote request end to end.
pub trait RemoteClient: Send + Sync {
    /// Run the request, blocking until the result is downloaded.
    ///
    /// `progress` receives every status line as it happens, on the calling
    /// thread. The returned payload may carry `href`, `size`, `type` and
    /// `messages`.
    fn execute(
        &self,
        call: RemoteCall<'_>,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, RemoteError>;
}

/// Result metadata extracted from a successful payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Download location
    pub href: Option<String>,
    /// Size in bytes
    pub size: Option<u64>,
    /// Content type
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ResultMetadata {
    /// Extract metadata. Absent or malformed fields become `None`.
    pub fn from_payload(payload: &Value) -> Self {
        let size = payload.get("size").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Self {
            href: payload.get("href").and_then(Value::as_str).map(str::to_string),
            size,
            kind: payload.get("type").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// Messages attached to a result payload, if any.
pub fn result_messages(payload: &Value) -> Option<Vec<String>> {
    let messages = payload.get("messages")?.as_array()?;
    Some(
        messages
            .iter()
            .map(|m| match m {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
    )
}
