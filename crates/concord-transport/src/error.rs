//! Transport error types

use thiserror::Error;

/// Transport errors. All of them are scoped to one peer session and are
/// retried on the next sync cycle.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Stream closed: {0}")]
    Closed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: String, got: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] concord_protocol::ProtocolError),

    #[error("Core error: {0}")]
    Core(#[from] concord_core::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
