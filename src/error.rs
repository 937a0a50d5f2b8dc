// src/error.rs

//! Crate-wide error type.
//!
//! Variants that end up in a wire `error` field display the bare message
//! without a category prefix, so clients see exactly the text the handler
//! produced.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, wrong message shape, unknown request type.
    #[error("{0}")]
    Protocol(String),

    /// Missing or wrong connection password.
    #[error("invalid password")]
    InvalidPassword,

    /// Bad request payload: unknown target, empty list, bad concurrency.
    #[error("{0}")]
    Validation(String),

    /// Query failure or lost database connection.
    #[error("{0}")]
    Storage(String),

    /// The peer went away while a request was outstanding.
    #[error("socket closed")]
    SocketClosed,

    #[error("{0}")]
    Config(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("malformed JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_facing_messages_have_no_prefix() {
        let e = Error::Validation("invalid target 'missing'".to_string());
        assert_eq!(e.to_string(), "invalid target 'missing'");

        let e = Error::Protocol("unknown request type: 'frob'".to_string());
        assert_eq!(e.to_string(), "unknown request type: 'frob'");

        assert_eq!(Error::InvalidPassword.to_string(), "invalid password");
        assert_eq!(Error::SocketClosed.to_string(), "socket closed");
    }
}
