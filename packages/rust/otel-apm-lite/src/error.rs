//! Error types for outbound calls and the uniform "log and continue" boundary.
//!
//! Every network-facing operation returns `Result<_, ApmError>`. Nothing in
//! this crate surfaces those errors to the host application: they are
//! reported through [`log_failure`] at the boundary and dropped.

use thiserror::Error;

/// Errors that can occur while talking to the backend or control plane.
#[derive(Error, Debug)]
pub enum ApmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} responded with {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("agent is disabled or has no API key")]
    Disabled,
}

pub type Result<T, E = ApmError> = std::result::Result<T, E>;

/// Logs a failed boundary call at warn level and converts it to an `Option`.
///
/// `operation` names the call in the log record, e.g. `"export"` or
/// `"breakpoint fetch"`.
pub fn log_failure<T>(operation: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(ApmError::Disabled) => {
            tracing::debug!(operation, "Skipped, agent disabled");
            None
        }
        Err(e) => {
            tracing::warn!(operation, error = %e, "Telemetry call failed");
            None
        }
    }
}
