//! Error types for the certmint backend.
//!
//! Every fallible operation returns one of two kinds of error, split by who
//! caused the problem:
//!
//! - [`PkiError::User`]: malformed input, a policy violation, or a missing
//!   prerequisite. The embedding layer should surface these inside a normal
//!   response payload.
//! - [`PkiError::Internal`]: unexpected failure of an underlying primitive
//!   (RNG, storage, DER parsing). The embedding layer should surface these
//!   as transport-level faults so an operator sees them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PkiError>;

#[derive(Debug, Error)]
pub enum PkiError {
    /// The caller supplied bad input or asked for something the configured
    /// policy does not allow.
    #[error("{0}")]
    User(String),

    /// An underlying primitive failed in a way the caller cannot fix.
    #[error("{0}")]
    Internal(String),
}

impl PkiError {
    pub fn user(msg: impl Into<String>) -> Self {
        PkiError::User(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PkiError::Internal(msg.into())
    }

    /// True for errors that belong in the response payload rather than on
    /// the transport.
    pub fn is_user_error(&self) -> bool {
        matches!(self, PkiError::User(_))
    }
}

impl From<openssl::error::ErrorStack> for PkiError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        PkiError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for PkiError {
    fn from(e: serde_json::Error) -> Self {
        PkiError::Internal(format!("serialization failure: {}", e))
    }
}

impl From<std::io::Error> for PkiError {
    fn from(e: std::io::Error) -> Self {
        PkiError::Internal(format!("storage i/o failure: {}", e))
    }
}
