//! Protocol error types.

use crate::codec::Opcode;
use crate::frame::IntWidth;
use thiserror::Error;

/// Errors raised while registering, framing, encoding or decoding packets.
///
/// Lookup misses are not errors: the lookup services return `Option` and
/// callers branch on absence. Only the outbound path turns a missing codec
/// into [`ProtocolError::NoCodecForMessage`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown packet: opcode {opcode} has no codec and the frame length cannot be determined")]
    UnknownPacket { opcode: Opcode },

    #[error("duplicate opcode {opcode}: already bound to {existing}, cannot bind {attempted}")]
    DuplicateOpcode {
        opcode: Opcode,
        existing: &'static str,
        attempted: &'static str,
    },

    #[error("duplicate codec for {message}: already bound to opcode {existing}")]
    DuplicateMessageType {
        message: &'static str,
        existing: Opcode,
    },

    #[error("duplicate handler for {message}")]
    DuplicateHandler { message: &'static str },

    #[error("incomplete frame: need {needed} more bytes")]
    IncompleteFrame { needed: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("opcode {opcode} does not fit in a {width} field")]
    OpcodeOutOfRange { opcode: Opcode, width: IntWidth },

    #[error("string too long: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },

    #[error("varint longer than {max_bytes} bytes")]
    VarIntTooLong { max_bytes: usize },

    #[error("varint does not fit in 32 bits")]
    VarIntOverflow,

    #[error("malformed {message} payload: {reason}")]
    MalformedPayload {
        message: &'static str,
        reason: String,
    },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("no codec registered for {message}")]
    NoCodecForMessage { message: &'static str },

    #[error("message type mismatch: expected {expected}, got {actual}")]
    MessageTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

impl ProtocolError {
    /// Returns whether the inbound byte stream can no longer be trusted.
    ///
    /// After a fatal error the read position no longer points at a frame
    /// boundary, so the owning connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownPacket { .. }
                | ProtocolError::FrameTooLarge { .. }
                | ProtocolError::VarIntTooLong { .. }
                | ProtocolError::VarIntOverflow
        )
    }

    /// Returns whether this is a registration-time configuration defect.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            ProtocolError::DuplicateOpcode { .. }
                | ProtocolError::DuplicateMessageType { .. }
                | ProtocolError::DuplicateHandler { .. }
        )
    }
}
