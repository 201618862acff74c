//! Error types for the submission pipeline and the DHIS2 bridge.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the core.
///
/// Expected failures on the hot path (a delivery that did not go through, a facility that is not
/// registered remotely) are usually reported as outcomes instead, see
/// [`FlushReport`](crate::submission_queue::FlushReport) and
/// [`FacilityResolver::resolve`](crate::facility_resolver::FacilityResolver::resolve).
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Facility \"{0}\" is not registered in DHIS2")]
    FacilityNotRegistered(String),

    #[error("Storage error: {0}")]
    Storage(#[from] lmdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Remote returned status {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether a later attempt could succeed without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Http(_) | CoreError::Timeout(_) => true,
            CoreError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
