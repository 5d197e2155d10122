//! Credential lookup.
//!
//! Explicit values win when all three are given. Otherwise the environment is
//! consulted, then the JSON rc file.

use datafetch_core::{FetchError, Result};
use datafetch_task::Credentials;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable holding the API endpoint.
pub const ENV_URL: &str = "ECMWF_API_URL";
/// Environment variable holding the API key.
pub const ENV_KEY: &str = "ECMWF_API_KEY";
/// Environment variable holding the account e-mail.
pub const ENV_EMAIL: &str = "ECMWF_API_EMAIL";
/// Environment variable overriding the rc file location.
pub const ENV_RC_FILE: &str = "ECMWF_API_RC_FILE";
/// rc file name in the home directory.
pub const RC_FILE_NAME: &str = ".ecmwfapirc";

/// Credential values supplied by the caller, possibly incomplete.
#[derive(Debug, Clone, Default)]
pub struct ExplicitCredentials {
    /// API endpoint
    pub url: Option<String>,
    /// API key
    pub key: Option<String>,
    /// Account e-mail
    pub email: Option<String>,
}

impl ExplicitCredentials {
    fn complete(&self) -> Option<Credentials> {
        match (&self.url, &self.key, &self.email) {
            (Some(url), Some(key), Some(email)) => Some(Credentials::new(url, key, email)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RcFile {
    url: Option<String>,
    key: Option<String>,
    email: Option<String>,
}

/// Resolve credentials from `explicit`, the process environment or the rc file.
pub fn resolve(explicit: &ExplicitCredentials) -> Result<Credentials> {
    resolve_with(explicit, |name| std::env::var(name).ok(), dirs::home_dir())
}

/// Resolve credentials with an injected environment and home directory.
pub fn resolve_with<E>(
    explicit: &ExplicitCredentials,
    env: E,
    home: Option<PathBuf>,
) -> Result<Credentials>
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(credentials) = explicit.complete() {
        debug!("Using explicit credentials");
        return Ok(credentials);
    }

    if let (Some(url), Some(key), Some(email)) = (env(ENV_URL), env(ENV_KEY), env(ENV_EMAIL)) {
        debug!("Using credentials from the environment");
        return Ok(Credentials::new(url, key, email));
    }

    let rc_path = env(ENV_RC_FILE)
        .map(PathBuf::from)
        .or_else(|| home.map(|home| home.join(RC_FILE_NAME)))
        .ok_or_else(|| {
            FetchError::Configuration("no credentials given and no home directory found".to_string())
        })?;
    read_rc_file(&rc_path)
}

/// Read credentials from a JSON rc file with `url`, `key` and `email`.
pub fn read_rc_file(path: &Path) -> Result<Credentials> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        FetchError::Configuration(format!(
            "cannot read credentials from {}: {}",
            path.display(),
            err
        ))
    })?;
    let rc: RcFile = serde_json::from_str(&text).map_err(|err| {
        FetchError::Configuration(format!("invalid credentials file {}: {}", path.display(), err))
    })?;

    match (rc.url, rc.key, rc.email) {
        (Some(url), Some(key), Some(email)) => {
            debug!(path = %path.display(), "Using credentials from rc file");
            Ok(Credentials::new(url, key, email))
        }
        _ => Err(FetchError::Configuration(format!(
            "credentials file {} must define url, key and email",
            path.display()
        ))),
    }
}
