use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Envelope every FFI call answers with, serialized as JSON.
#[derive(Debug, Serialize, Deserialize)]
pub enum AppResponse {
    DatabaseError(String),
    SerializationError(String),
    NotFound(String),
    ValidationError(String),
    NetworkError(String),
    BadRequest(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppResponse::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<CoreError> for AppResponse {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => AppResponse::ValidationError(msg),
            CoreError::FacilityNotRegistered(_) => AppResponse::NotFound(err.to_string()),
            CoreError::Storage(lmdb::Error::MapFull) =>
                AppResponse::DatabaseError("Local storage is full".to_string()),
            CoreError::Storage(e) => AppResponse::DatabaseError(format!("LMDB error: {}", e)),
            CoreError::Io(e) => AppResponse::DatabaseError(format!("IO error: {}", e)),
            CoreError::Json(e) =>
                AppResponse::SerializationError(format!("JSON serialization error: {}", e)),
            CoreError::Config(msg) => AppResponse::BadRequest(format!("Invalid configuration: {}", msg)),
            CoreError::Http(_) | CoreError::Timeout(_) | CoreError::Remote { .. } =>
                AppResponse::NetworkError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppResponse {
    fn from(err: serde_json::Error) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }

    /// Wraps a serializable value as an `Ok` response carrying its JSON.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(json) => AppResponse::Ok(json),
            Err(e) => AppResponse::from(e),
        }
    }
}
