//! Error types for steward

use thiserror::Error;

/// Main error type for steward operations
#[derive(Debug, Error)]
pub enum StewardError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("missing addressing: {0}")]
    AddressingMissing(String),

    #[error("max retries reached for message {id} on {subject}")]
    MaxRetries { id: u64, subject: String },

    #[error("not allowed from {0}")]
    NotAllowed(String),

    #[error("signature verification failed for {0}")]
    SignatureInvalid(String),

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<rmp_serde::encode::Error> for StewardError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::MalformedMessage(format!("encode: {err}"))
    }
}

impl From<rmp_serde::decode::Error> for StewardError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::MalformedMessage(format!("decode: {err}"))
    }
}

impl From<serde_cbor::Error> for StewardError {
    fn from(err: serde_cbor::Error) -> Self {
        Self::Internal(format!("CBOR error: {err}"))
    }
}

/// Result type alias for steward operations
pub type Result<T> = std::result::Result<T, StewardError>;
