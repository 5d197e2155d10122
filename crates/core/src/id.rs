//! Unique identifiers for locally tracked work.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Local identity of a request task.
///
/// Assigned at construction, long before the server hands out its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey(Ulid);

impl TaskKey {
    /// Generate a new TaskKey
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TaskKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskKey {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identity of one submission to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId(Ulid);

impl HandleId {
    /// Generate a new HandleId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
