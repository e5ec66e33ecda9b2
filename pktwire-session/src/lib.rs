//! # pktwire-session
//!
//! Sessions on top of the pktwire packet layer.
//!
//! This crate provides:
//! - The built-in protocol versions (`classic`, `framed`, `compact`)
//! - Message types and their handlers
//! - Per-connection session state and the decode/dispatch pipeline
//! - YAML configuration with environment overrides
//! - Prometheus metrics
//! - A tokio TCP server

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod messages;
pub mod metrics;
pub mod server;
pub mod session;
pub mod versions;

pub use config::{Config, ConfigError, LogConfig, NetworkConfig, ProtocolConfig, SessionConfig};
pub use connection::Connection;
pub use error::SessionError;
pub use handler::{builtin_handlers, CommandSink, Invocation, LoggingSink, RecordingSink};
pub use messages::{Chat, CommandInvoke, Introduction, Kick, Ping, Pong};
pub use metrics::{error_kind, Metrics};
pub use server::{drive, Server, ServerConfig, ServerStats};
pub use session::{
    Session, SessionState, SessionStats, DEFAULT_INBOX_LIMIT, DEFAULT_OUTBOUND_LIMIT,
    DEFAULT_PENDING_PING_LIMIT,
};
pub use versions::{register_builtin, BUILTIN_PROTOCOLS, CLASSIC, COMPACT, FRAMED};
