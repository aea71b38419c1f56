//! Error types for the scheduler.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job definition violates its kind's invariants. Never persisted.
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// More than one job carries the given name.
    #[error("job name '{0}' is ambiguous, use the job id")]
    AmbiguousName(String),

    /// Geofence definition failed validation.
    #[error(transparent)]
    InvalidLocation(#[from] locron_location::InvalidLocation),

    /// Not a known IANA timezone name.
    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    /// Named location not found.
    #[error("location not found: {0}")]
    LocationNotFound(String),

    /// Persisted runtime state failed structural validation.
    #[error("state corrupt: {0}")]
    StateCorrupt(String),

    /// A persisted record other than runtime state could not be parsed.
    #[error("corrupt record {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    /// Another tick is still running.
    #[error("tick already in progress")]
    Busy,

    /// External cron engine error.
    #[error("gateway error: {0}")]
    Gateway(#[from] locron_gateway::GatewayError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
