//! Blocking web API client.
//!
//! Implements the submit / poll / download / delete cycle of the data
//! retrieval web API on top of `reqwest::blocking`, reporting progress as the
//! text lines [`datafetch_core::LineParser`] understands.

use datafetch_core::RemoteError;
use datafetch_task::{Credentials, RemoteCall, RemoteClient};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use serde_json::Value;
use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Poll interval used when the server sends no `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Default timeout of a single HTTP exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("datafetch/", env!("CARGO_PKG_VERSION"));

/// Failure of one HTTP exchange.
#[derive(Debug, thiserror::Error)]
enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {code} from {url}")]
    Status {
        code: u16,
        url: String,
        reply: Option<Value>,
    },

    #[error("cannot write {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl From<ExchangeError> for RemoteError {
    fn from(err: ExchangeError) -> Self {
        match &err {
            ExchangeError::Status {
                reply: Some(reply), ..
            } => RemoteError::new(err.to_string()).with_details(server_details(reply)),
            _ => RemoteError::new(err.to_string()),
        }
    }
}

/// Server reply to a submission or status poll.
struct Reply {
    body: Value,
    location: Option<String>,
    retry_after: Duration,
}

/// [`RemoteClient`] speaking the web API over HTTP.
#[derive(Clone)]
pub struct WebApiClient {
    client: Client,
    default_retry: Duration,
}

impl WebApiClient {
    /// Create a client with the default timeout.
    pub fn new() -> Result<Self, RemoteError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a client whose individual HTTP exchanges time out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RemoteError::new(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            default_retry: DEFAULT_RETRY_AFTER,
        })
    }

    /// Poll interval used when the server does not suggest one.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.default_retry = interval;
        self
    }

    fn authorized(&self, builder: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        builder
            .header("Accept", "application/json")
            .header("From", credentials.email.as_str())
            .header("X-ECMWF-KEY", credentials.key.as_str())
    }

    fn exchange(&self, builder: RequestBuilder, url: &str) -> Result<Reply, ExchangeError> {
        let response = builder.send()?;
        let code = response.status();
        let headers = response.headers().clone();
        let text = response.text()?;
        trace!(url = %url, status = code.as_u16(), "HTTP reply: {}", text);

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !code.is_success() {
            return Err(ExchangeError::Status {
                code: code.as_u16(),
                url: url.to_string(),
                reply: Some(body),
            });
        }

        Ok(Reply {
            location: location(&headers, url),
            retry_after: retry_after(&headers, self.default_retry),
            body,
        })
    }

    fn submit(&self, call: &RemoteCall<'_>) -> Result<Reply, ExchangeError> {
        let url = requests_url(&call.credentials.url, &call.address.to_string());
        debug!(url = %url, "Submitting request");
        let builder = self.authorized(self.client.post(&url), call.credentials).json(call.payload);
        self.exchange(builder, &url)
    }

    fn poll(&self, url: &str, credentials: &Credentials) -> Result<Reply, ExchangeError> {
        debug!(url = %url, "Polling request");
        self.exchange(self.authorized(self.client.get(url), credentials), url)
    }

    fn download(
        &self,
        href: &str,
        target: &Path,
        credentials: &Credentials,
    ) -> Result<u64, ExchangeError> {
        debug!(href = %href, target = %target.display(), "Downloading result");
        let mut response: Response = self
            .authorized(self.client.get(href), credentials)
            .send()?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status {
                code: response.status().as_u16(),
                url: href.to_string(),
                reply: None,
            });
        }
        let io_error = |source| ExchangeError::Io {
            path: target.display().to_string(),
            source,
        };
        let mut file = File::create(target).map_err(io_error)?;
        let written = response.copy_to(&mut file)?;
        file.sync_all().map_err(io_error)?;
        Ok(written)
    }

    fn delete(&self, url: &str, credentials: &Credentials) {
        debug!(url = %url, "Deleting request");
        let builder = self.authorized(self.client.delete(url), credentials);
        if let Err(err) = self.exchange(builder, url) {
            warn!(url = %url, "Failed to delete request: {}", err);
        }
    }
}

impl RemoteClient for WebApiClient {
    fn execute(
        &self,
        call: RemoteCall<'_>,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, RemoteError> {
        let mut reply = self.submit(&call)?;
        progress("Request submitted");

        let mut reported_messages = 0;
        let mut last_status: Option<String> = None;
        let mut poll_url = reply.location.clone();

        if let Some(name) = reply.body.get("name").and_then(Value::as_str) {
            progress(&format!("Request id: {}", name));
        }

        let body = loop {
            reported_messages = forward_messages(&reply.body, reported_messages, progress);

            let status = reply
                .body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if last_status.as_deref() != Some(status.as_str()) {
                progress(&format!("Request is {}", status));
                last_status = Some(status.clone());
            }

            match status.as_str() {
                "complete" => break reply.body,
                "queued" | "active" | "submitted" | "waiting" => {}
                _ => {
                    let message = reply
                        .body
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Request ended with status {}", status));
                    return Err(RemoteError::new(message).with_details(server_details(&reply.body)));
                }
            }

            let Some(url) = poll_url.clone() else {
                return Err(RemoteError::new(format!(
                    "Request is {} but the server gave no location to poll",
                    status
                )));
            };
            thread::sleep(reply.retry_after);
            reply = self.poll(&url, call.credentials)?;
            if reply.location.is_some() {
                poll_url = reply.location.clone();
            }
        };

        if let Some(href) = body.get("href").and_then(Value::as_str) {
            let size = body.get("size").and_then(Value::as_u64);
            progress(&format!(
                "Transferring {} into {}",
                size.map_or_else(|| "unknown size".to_string(), human_size),
                call.target.display()
            ));
            progress(&format!("From {}", href));

            let started = Instant::now();
            let written = self.download(href, call.target, call.credentials)?;
            let seconds = started.elapsed().as_secs_f64().max(0.001);
            progress(&format!(
                "Transfer rate {}/s",
                human_size((written as f64 / seconds) as u64)
            ));

            if let Some(expected) = size {
                if expected != written {
                    return Err(RemoteError::new(format!(
                        "Size mismatch: expected {} bytes, got {}",
                        expected, written
                    )));
                }
            }
        }

        if let Some(url) = poll_url {
            self.delete(&url, call.credentials);
        }
        progress("Done.");
        Ok(body)
    }
}

/// `<url>/<address>/requests`
pub fn requests_url(base: &str, address: &str) -> String {
    format!("{}/{}/requests", base.trim_end_matches('/'), address.trim_matches('/'))
}

/// Seconds from `Retry-After`, or `default`.
fn retry_after(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Absolute polling location from the `Location` header.
fn location(headers: &HeaderMap, request_url: &str) -> Option<String> {
    let value = headers.get(LOCATION)?.to_str().ok()?;
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    let base = reqwest::Url::parse(request_url).ok()?;
    base.join(value).ok().map(String::from)
}

/// Server `messages` and `error` fields, best effort.
fn server_details(reply: &Value) -> Vec<String> {
    let mut details: Vec<String> = reply
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|m| m.as_str().map_or_else(|| m.to_string(), str::to_string))
                .collect()
        })
        .unwrap_or_default();
    if let Some(error) = reply.get("error").and_then(Value::as_str) {
        details.push(error.to_string());
    }
    details
}

/// Forward messages not reported yet. Returns how many have been reported.
fn forward_messages(reply: &Value, reported: usize, progress: &mut dyn FnMut(&str)) -> usize {
    let Some(messages) = reply.get("messages").and_then(Value::as_array) else {
        return reported;
    };
    for message in messages.iter().skip(reported) {
        match message.as_str() {
            Some(text) => progress(text),
            None => progress(&message.to_string()),
        }
    }
    messages.len().max(reported)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
