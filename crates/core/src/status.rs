//! Request status state machine.
//!
//! The machine is pure: it maps the current [`TaskState`] and an input to the
//! next state plus the list of [`Effect`]s the caller has to perform. Nothing
//! here touches threads, clocks or callbacks.
//!
//! ```text
//! waiting → submitted → queued → active → complete
//!              │           │        │
//!              └───────────┴────────┴──→ error
//! (any non-terminal) ──────────────────→ cancelled
//! ```

use crate::progress::ProgressEvent;
use serde::{Deserialize, Serialize};

/// Current status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Not yet picked up by a worker
    Waiting,
    /// Submitted to the server
    Submitted,
    /// Queued by the server
    Queued,
    /// Being processed by the server
    Active,
    /// Data downloaded, request finished
    Complete,
    /// Cancelled locally
    Cancelled,
    /// Failed
    Error,
}

impl RequestStatus {
    /// Whether no further transitions are permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Error)
    }

    /// Position along the success path. Terminal statuses share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Submitted => 1,
            Self::Queued => 2,
            Self::Active => 3,
            Self::Complete | Self::Cancelled | Self::Error => 4,
        }
    }

    /// Lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown request status: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for RequestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "submitted" => Ok(Self::Submitted),
            "queued" => Ok(Self::Queued),
            "active" => Ok(Self::Active),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// How the underlying work item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    /// Returned a result
    Completed,
    /// Returned or raised an error
    Failed,
    /// Cancelled before it started
    Cancelled,
}

impl FinishKind {
    /// Terminal status this outcome leads to.
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Completed => RequestStatus::Complete,
            Self::Failed => RequestStatus::Error,
            Self::Cancelled => RequestStatus::Cancelled,
        }
    }
}

/// Side effect requested by a state machine step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Status changed: record elapsed time and notify observers
    Transition(RequestStatus),
    /// Server-assigned identifier became known
    AssignId(String),
    /// Append a line to the message log
    Log(String),
}

/// Result of feeding one input into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// State after the step
    pub next: TaskState,
    /// Effects to perform, in order
    pub effects: Vec<Effect>,
}

/// Status and identity of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    /// Current status
    pub status: RequestStatus,
    /// Server-assigned id, once reported
    pub id: Option<String>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: RequestStatus::Waiting,
            id: None,
        }
    }
}

impl TaskState {
    /// Whether a progress line may move the status to `to`.
    ///
    /// Progress lines only move forward through the non-terminal statuses.
    /// Terminal statuses are reserved for [`TaskState::on_finish`].
    pub fn accepts_progress(&self, to: RequestStatus) -> bool {
        !self.status.is_terminal() && !to.is_terminal() && to.rank() > self.status.rank()
    }

    /// Process one progress event.
    ///
    /// Every event produces a `Log` effect carrying the raw line. A
    /// `Transition` precedes it when the status moves.
    pub fn on_progress(&self, event: &ProgressEvent) -> Step {
        let mut next = self.clone();
        let mut effects = Vec::new();

        match event {
            ProgressEvent::StatusChanged { status, .. } => {
                if self.accepts_progress(*status) {
                    next.status = *status;
                    effects.push(Effect::Transition(*status));
                }
            }
            ProgressEvent::IdAssigned { id, .. } => {
                if self.id.is_none() {
                    next.id = Some(id.clone());
                    effects.push(Effect::AssignId(id.clone()));
                }
            }
            ProgressEvent::Other(_) => {}
        }

        effects.push(Effect::Log(event.line().to_string()));
        Step { next, effects }
    }

    /// Process the end of the work item.
    ///
    /// A state that is already terminal yields no effects, which makes
    /// finalization idempotent.
    pub fn on_finish(&self, kind: FinishKind) -> Step {
        let mut next = self.clone();
        let mut effects = Vec::new();

        if !self.status.is_terminal() {
            let status = kind.status();
            next.status = status;
            effects.push(Effect::Transition(status));
        }

        Step { next, effects }
    }
}
