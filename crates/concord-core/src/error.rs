//! Error types for Concord Core

use concord_storage::StorageError;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed op, digest or user input
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The storage collaborator failed; the triggering call must not proceed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for Concord Core operations
pub type Result<T> = std::result::Result<T, Error>;
