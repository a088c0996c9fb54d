//! Error handling for the consumer engine
//!
//! Configuration errors are fatal to the instance being constructed;
//! request errors preserve prior state. Transient upstream conditions
//! (score drops, missing Sender Reports, disappearing streams) are never
//! errors: the layer state machine observes them and re-plans.

use thiserror::Error;

use crate::types::MimeType;

/// Result type alias for consumer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the consumer engine
#[derive(Error, Debug)]
pub enum Error {
    /// Construction input violates the consumer invariants
    #[error("invalid consumer configuration: {details}")]
    InvalidConfig { details: String },

    /// The negotiated codec cannot drive a simulcast consumer
    #[error("codec not supported for simulcast: {mime_type}")]
    UnsupportedCodec { mime_type: MimeType },

    /// Malformed request parameters (missing or ill-typed field)
    #[error("invalid request: {details}")]
    InvalidRequest { details: String },
}

impl Error {
    pub(crate) fn config(details: impl Into<String>) -> Self {
        Self::InvalidConfig {
            details: details.into(),
        }
    }

    pub(crate) fn request(details: impl Into<String>) -> Self {
        Self::InvalidRequest {
            details: details.into(),
        }
    }
}
