//! # pktwire-protocol
//!
//! Packet protocol layer for pktwire.
//!
//! This crate provides:
//! - Opcode-tagged framing with optional length prefix
//! - Bidirectional codec lookup (opcode ↔ message type)
//! - Message handler lookup and dispatch
//! - The `Protocol` capability and a configurable `StandardProtocol`
//! - A registry of protocol versions by id

pub mod buffer;
pub mod chat;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handler;
pub mod lookup;
pub mod message;
pub mod protocol;
pub mod registry;

pub use buffer::{BufExt, BufMutExt};
pub use chat::{ChatArguments, ChatPart, ChatStyle, Command};
pub use codec::{MessageCodec, Opcode, PayloadCodec, Wire, WireCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameLayout, HeaderPeek, IntWidth};
pub use handler::{Dispatch, Handler, HandlerError, HandlerLookupService, MessageHandler};
pub use lookup::{CodecLookupService, RegistrationPolicy};
pub use message::{Message, MessageType};
pub use protocol::{
    HeaderRead, Inbound, MessageFactory, Protocol, SharedProtocol, StandardProtocol,
};
pub use registry::ProtocolRegistry;

/// Default maximum frame payload size (2 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;
