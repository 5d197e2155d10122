//! Progress events parsed from free-text server lines.

use crate::status::RequestStatus;
use regex::Regex;

/// One progress line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The server reported a status
    StatusChanged {
        /// Reported status
        status: RequestStatus,
        /// Raw line
        line: String,
    },
    /// The server reported the request identifier
    IdAssigned {
        /// Server-assigned id
        id: String,
        /// Raw line
        line: String,
    },
    /// Anything else
    Other(String),
}

impl ProgressEvent {
    /// The raw line the event was parsed from.
    pub fn line(&self) -> &str {
        match self {
            Self::StatusChanged { line, .. } | Self::IdAssigned { line, .. } => line,
            Self::Other(line) => line,
        }
    }
}

/// Classifies progress lines.
///
/// Swap the implementation to follow a different server dialect without
/// touching the state machine.
pub trait ProgressParser: Send + Sync {
    /// Classify one line.
    fn parse(&self, line: &str) -> ProgressEvent;
}

/// Parser for the web API dialect.
///
/// Recognises `Request is <state>`, `Request id: <id>` and
/// `Request submitted`. Unknown state names are reported as [`ProgressEvent::Other`].
#[derive(Debug, Clone)]
pub struct LineParser {
    status: Regex,
    id: Regex,
    submitted: Regex,
}

impl LineParser {
    /// Create the default parser.
    pub fn new() -> Self {
        Self {
            status: Regex::new(r"^Request is (?P<status>.+)$").expect("valid regex"),
            id: Regex::new(r"^Request id: (?P<id>.+)$").expect("valid regex"),
            submitted: Regex::new(r"^Request submitted\s*$").expect("valid regex"),
        }
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser for LineParser {
    fn parse(&self, line: &str) -> ProgressEvent {
        // Servers may hand over lines with their terminators attached
        let line = line.trim_end_matches(['\r', '\n']);
        let text = line.trim();

        if let Some(caps) = self.status.captures(text) {
            if let Ok(status) = caps["status"].parse::<RequestStatus>() {
                return ProgressEvent::StatusChanged {
                    status,
                    line: line.to_string(),
                };
            }
        }

        if let Some(caps) = self.id.captures(text) {
            let id = caps["id"].trim();
            if !id.is_empty() {
                return ProgressEvent::IdAssigned {
                    id: id.to_string(),
                    line: line.to_string(),
                };
            }
        }

        if self.submitted.is_match(text) {
            return ProgressEvent::StatusChanged {
                status: RequestStatus::Submitted,
                line: line.to_string(),
            };
        }

        ProgressEvent::Other(line.to_string())
    }
}
