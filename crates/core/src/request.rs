//! Request descriptions and service routing.

use crate::error::{FetchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Field naming a dataset (`datasets/<name>`).
pub const DATASET_FIELD: &str = "dataset";
/// Field naming a service (`services/<name>`).
pub const SERVICE_FIELD: &str = "service";
/// Field naming the local destination.
pub const TARGET_FIELD: &str = "target";

/// A request as a mapping of field names to values.
///
/// Field order is preserved so the request echo in logs matches what the
/// caller wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestDescription(Map<String, Value>);

impl RequestDescription {
    /// Create an empty description.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Set a field, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether a field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Overlay `overrides` on a copy of `defaults`.
    pub fn merged(defaults: &RequestDescription, overrides: &RequestDescription) -> Self {
        let mut map = defaults.0.clone();
        for (key, value) in &overrides.0 {
            map.insert(key.clone(), value.clone());
        }
        Self(map)
    }

    /// Parse a JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(FetchError::Configuration(format!(
                "request must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a MARS-style text request.
    ///
    /// ```text
    /// retrieve,
    ///   class  = od,
    ///   param  = 129/130,
    ///   target = "out.grib"
    /// ```
    ///
    /// The verb is optional and must be `retrieve` when present. `#` starts a
    /// comment. Values keep their text form, quotes stripped.
    pub fn from_mars_text(text: &str) -> Result<Self> {
        let mut map = Map::new();
        let stripped: String = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n");

        for (index, item) in stripped.split([',', '\n']).enumerate() {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim().to_lowercase();
                    if key.is_empty() {
                        return Err(FetchError::Configuration(format!(
                            "missing field name before '=' in '{}'",
                            item
                        )));
                    }
                    let value = value.trim().trim_matches(|c: char| c == '"' || c == '\'');
                    map.insert(key, Value::String(value.to_string()));
                }
                None if index == 0 || map.is_empty() => {
                    if !item.eq_ignore_ascii_case("retrieve") {
                        return Err(FetchError::Configuration(format!(
                            "unsupported request verb '{}'",
                            item
                        )));
                    }
                }
                None => {
                    return Err(FetchError::Configuration(format!(
                        "expected 'key = value', got '{}'",
                        item
                    )));
                }
            }
        }

        Ok(Self(map))
    }

    /// Parse either a JSON object or MARS text, judged by the first character.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim_start().starts_with('{') {
            Self::from_json(text)
        } else {
            Self::from_mars_text(text)
        }
    }
}

impl From<Map<String, Value>> for RequestDescription {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Remote address a request is sent to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceAddress {
    /// A public dataset
    Dataset(String),
    /// A named service such as `mars`
    Service(String),
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dataset(name) => write!(f, "datasets/{}", name),
            Self::Service(name) => write!(f, "services/{}", name),
        }
    }
}

/// A request ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    /// Where to send it
    pub address: ServiceAddress,
    /// Local destination, not sent to the server
    pub target: PathBuf,
    /// Body sent to the server
    pub payload: Map<String, Value>,
}

/// Resolves request descriptions into service addresses.
#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    /// Create a router.
    pub fn new() -> Self {
        Self
    }

    /// Determine the address and split off the target.
    ///
    /// Exactly one of `dataset` and `service` must be present. The addressing
    /// field stays in the payload; `target` is removed from it.
    pub fn resolve(&self, description: RequestDescription) -> Result<ResolvedRequest> {
        let address = Self::address(&description)?;
        let mut payload = description.into_map();

        let target = match payload.remove(TARGET_FIELD) {
            Some(Value::String(target)) if !target.trim().is_empty() => PathBuf::from(target),
            Some(other) => {
                return Err(FetchError::Configuration(format!(
                    "target must be a non-empty string, got {}",
                    other
                )))
            }
            None => {
                return Err(FetchError::Configuration(
                    "target must be specified in the request".to_string(),
                ))
            }
        };

        Ok(ResolvedRequest {
            address,
            target,
            payload,
        })
    }

    /// Determine the address without consuming the description.
    pub fn address(description: &RequestDescription) -> Result<ServiceAddress> {
        let dataset = description.get(DATASET_FIELD);
        let service = description.get(SERVICE_FIELD);

        match (dataset, service) {
            (Some(_), Some(_)) => Err(FetchError::Configuration(
                "dataset and service are mutually exclusive".to_string(),
            )),
            (None, None) => Err(FetchError::Configuration(
                "dataset or service must be specified in the request".to_string(),
            )),
            (Some(name), None) => Ok(ServiceAddress::Dataset(field_name(DATASET_FIELD, name)?)),
            (None, Some(name)) => Ok(ServiceAddress::Service(field_name(SERVICE_FIELD, name)?)),
        }
    }
}

fn field_name(field: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(name) if !name.trim().is_empty() => Ok(name.trim().to_string()),
        other => Err(FetchError::Configuration(format!(
            "{} must be a non-empty string, got {}",
            field, other
        ))),
    }
}
