//! Typed error hierarchy for the session orchestration core.
//!
//! - `ProvisionError`: sandbox creation failures, surfaced by kind
//! - `BackendError`: runtime driver failures (exec, attach, teardown)
//! - `MergeError`: rejected or failed PR merges
//! - `WorkflowError`: an aborted git/PR step with the partial state reached
//! - `SessionError`: everything the facade can return to a caller

use std::time::Duration;

use thiserror::Error;

use crate::sessions::models::{CheckStatus, MergeMethod, SessionStatus};

/// Sandbox provisioning failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProvisionError {
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Resource quota exceeded: {0}")]
    ResourceQuotaExceeded(String),

    #[error("Provisioning timed out after {attempts} attempt(s) ({timeout:?} each)")]
    Timeout { attempts: u32, timeout: Duration },

    #[error("Execution backend unavailable: {0}")]
    Unavailable(String),
}

impl ProvisionError {
    /// Timeouts and an unreachable engine are worth another attempt; a bad
    /// image or an exhausted quota will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ImagePullFailed { .. } => "image_pull_failed",
            Self::ResourceQuotaExceeded(_) => "resource_quota_exceeded",
            Self::Timeout { .. } => "timeout",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Failures from a running sandbox.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Sandbox {0} not found")]
    NotFound(String),

    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Sandbox {0} already has an open stream")]
    StreamBusy(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("Backend error: {0}")]
    Engine(String),

    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Merge request failures. None of these change the session's status.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Pull request is not mergeable (check status: {})", .status.map(|s| s.as_str()).unwrap_or("none"))]
    NotMergeable { status: Option<CheckStatus> },

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Source control host error: {0}")]
    RemoteError(String),

    #[error("Merge method '{}' is not allowed for this repository", .method.as_str())]
    MethodNotAllowed { method: MergeMethod },
}

/// A git/PR step failed; earlier steps are listed so an operator can pick
/// up from where the run stopped.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{step} failed: {reason} (completed: {})", completed_summary(.completed))]
pub struct WorkflowError {
    pub step: String,
    pub completed: Vec<String>,
    pub reason: String,
}

fn completed_summary(completed: &[String]) -> String {
    if completed.is_empty() {
        "nothing".to_string()
    } else {
        completed.join(", ")
    }
}

/// Errors returned from the orchestration facade.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: String },

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("Session {id} is {status}; consoles attach only to running or idle sessions")]
    NotAttachable { id: String, status: SessionStatus },

    #[error("Session {id} is {status} and cannot be deleted")]
    NotDeletable { id: String, status: SessionStatus },

    #[error("Session {id} is {status}; the operation needs a running or idle session")]
    NotActive { id: String, status: SessionStatus },

    #[error("Session {id} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}
