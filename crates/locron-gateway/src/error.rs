//! Error types for the gateway client.

use thiserror::Error;

/// Errors that can occur when talking to the external cron engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The engine could not be reached, timed out, or kept failing.
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The bearer credential was rejected.
    #[error("gateway authentication failed: {0}")]
    AuthFailed(String),

    /// The referenced external job does not exist.
    #[error("external job not found: {0}")]
    NotFound(String),

    /// The engine refused the request.
    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Check if an error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Unreachable(_) => true,
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}
