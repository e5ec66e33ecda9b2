//! Session error types.

use crate::config::ConfigError;
use pktwire_protocol::ProtocolError;
use thiserror::Error;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("framing is no longer valid; the connection must be closed")]
    FramingInvalid,

    #[error("session is closed")]
    Closed,

    #[error("outbound queue full ({limit} messages)")]
    OutboundQueueFull { limit: usize },

    #[error("handler for {message} failed: {reason}")]
    Handler {
        message: &'static str,
        reason: String,
    },

    #[error("server shutting down")]
    ShuttingDown,
}

impl SessionError {
    /// Returns whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Io(_) | SessionError::FramingInvalid | SessionError::Closed => true,
            SessionError::ShuttingDown => true,
            SessionError::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }
}
