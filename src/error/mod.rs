//! Request-level error taxonomy and wire serialization.
//!
//! Every failure a caller can observe is a [`ServiceError`]. Errors are
//! serialized onto the wire as `{"__type": "<Kind>", "message": <reason|null>}`
//! with the status code given by [`ServiceError::status`]. Internal errors
//! never carry their reason to the caller; it is logged server-side only.

use thiserror::Error;

use crate::http::{BodyError, Method, StatusCode};

/// A request-processing failure, classified per the framework's taxonomy.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No handler is registered for the requested (path, method).
    #[error("no operation registered for {method} {path}")]
    InvalidOperation { path: String, method: Method },

    /// A field codec failed to produce the typed operation input.
    #[error("failed to decode operation input: {message}")]
    Decoding { message: String },

    /// The decoded input (or an over-cap body) failed validation.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// The operation failed with an error kind it declared, mapped to a status.
    #[error("operation failed with declared error {kind}")]
    Declared {
        kind: String,
        status: StatusCode,
        message: Option<String>,
    },

    /// Anything else: output encoding/validation failures, unmatched
    /// operation errors, writer misuse. The message is for logs only.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// Shorthand for a decoding failure.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for an internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidOperation { .. } | Self::Decoding { .. } | Self::Validation { .. } => {
                StatusCode::BadRequest
            }
            Self::Declared { status, .. } => *status,
            Self::Internal { .. } => StatusCode::InternalServerError,
        }
    }

    /// The `__type` discriminator serialized to the caller.
    pub fn wire_type(&self) -> &str {
        match self {
            Self::InvalidOperation { .. } => "InvalidOperation",
            Self::Decoding { .. } => "DecodingError",
            Self::Validation { .. } => "ValidationError",
            Self::Declared { kind, .. } => kind.as_str(),
            Self::Internal { .. } => "InternalError",
        }
    }

    /// The `message` field serialized to the caller.
    ///
    /// Internal errors suppress their reason; invalid-operation errors report
    /// the unmatched (path, method).
    pub fn wire_message(&self) -> Option<String> {
        match self {
            Self::InvalidOperation { path, method } => {
                Some(format!("no operation for {method} {path}"))
            }
            Self::Decoding { message } | Self::Validation { message } => Some(message.clone()),
            Self::Declared { message, .. } => message.clone(),
            Self::Internal { .. } => None,
        }
    }

    /// Serializes the error body: `{"__type": "<Kind>", "message": <reason|null>}`.
    pub fn to_wire_json(&self) -> Vec<u8> {
        let payload = serde_json::json!({
            "__type": self.wire_type(),
            "message": self.wire_message(),
        });
        // Object of two scalar fields; serialization cannot fail.
        serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec())
    }
}

impl From<BodyError> for ServiceError {
    fn from(err: BodyError) -> Self {
        // Over-cap and cancelled bodies both classify as validation.
        Self::validation(err.to_string())
    }
}
