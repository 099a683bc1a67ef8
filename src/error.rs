use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Error surfaced for a single call.
///
/// This is what a [`crate::client::RequestHandler`] retrieval returns after
/// `notify_error`, and what a server sink hands to its response context. The
/// remote variant preserves the error type token across the wire.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("remote error [{error_type}]: {message}")]
    Remote { error_type: String, message: String },

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("component is closed")]
    Closed,
}

impl CallError {
    pub fn remote(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        CallError::Remote {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Type token carried on the wire inside an exception envelope.
    pub fn error_type(&self) -> &str {
        match self {
            CallError::Remote { error_type, .. } => error_type,
            CallError::MessageTooLarge { .. } => "MessageTooLarge",
            CallError::InvalidSignal(_) => "InvalidSignal",
            CallError::Transport(_) => "TransportFailure",
            CallError::Closed => "ComponentClosed",
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::Transport(err.to_string())
    }
}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        CallError::InvalidSignal(err.to_string())
    }
}

/// Payload codec failure (user message could not be encoded or decoded).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the per-layer errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
