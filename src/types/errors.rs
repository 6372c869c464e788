//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the routing core.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (bad configuration, malformed routes).
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup miss (unknown service, method, route code).
    #[error("not found: {0}")]
    NotFound(String),

    /// Handler registration rejected.
    #[error("registration error: {0}")]
    Registration(String),

    /// Inbound bytes could not be decoded into a packet or message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be encoded for the wire.
    #[error("encode error: {0}")]
    Encode(String),

    /// Declared packet body exceeds the deployment cap.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error must tear down the connection that produced it.
    ///
    /// Decode and routing failures only drop the offending unit.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Error::FrameTooLarge { .. } | Error::Io(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
