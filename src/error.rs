use thiserror::Error;

use crate::scheduler::job::{JobId, JobState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("Job not found: {0}")]
    UnknownJob(JobId),

    #[error("Node {0} is not accepting allocations")]
    NodeUnavailable(String),

    #[error("Node {0} still has allocations")]
    NodeBusy(String),

    #[error("Insufficient resources on node {0}")]
    InsufficientResources(String),

    #[error("Release on node {0} exceeds total capacity, clamped")]
    OverRelease(String),

    #[error("Invalid request for job {job_id}: {reason}")]
    InvalidRequest { job_id: JobId, reason: String },

    #[error("Malformed job request: {0}")]
    MalformedRequest(String),

    #[error("Dependency on unknown job {0}")]
    UnknownDependency(JobId),

    #[error("Dependency cycle through job {0}")]
    DependencyCycle(JobId),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("{principal} may not cancel job {job_id}")]
    PermissionDenied { job_id: JobId, principal: String },

    #[error("Pending job queue is full")]
    QueueFull,

    #[error("Controller event queue is full, retry later")]
    Backpressure,

    #[error("Timed out waiting for the controller")]
    Timeout,

    #[error("Controller is not running")]
    ControllerUnavailable,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SchedError {
    /// Errors a caller should retry rather than report as a job failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedError::InsufficientResources(_)
                | SchedError::Backpressure
                | SchedError::QueueFull
                | SchedError::Timeout
        )
    }
}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        SchedError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(e: serde_json::Error) -> Self {
        SchedError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
