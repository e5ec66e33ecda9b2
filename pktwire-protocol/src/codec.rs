//! Message codecs.
//!
//! A [`PayloadCodec`] knows how to turn one message type into payload bytes
//! and back. A [`MessageCodec`] binds such a codec to an opcode; that pair is
//! what a protocol version registers. The same payload codec can be bound to
//! different opcodes in different protocol versions.

use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use bytes::BytesMut;
use std::fmt;
use std::marker::PhantomData;

/// Integer tag identifying a message's wire type within one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u32);

impl Opcode {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        Self(u32::from(value))
    }
}

impl From<u16> for Opcode {
    fn from(value: u16) -> Self {
        Self(u32::from(value))
    }
}

impl From<u32> for Opcode {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Encode/decode logic for one message type.
///
/// `decode` reads from the front of `buf` and leaves it positioned after the
/// message. Implementations must read through [`BufExt`](crate::buffer::BufExt)
/// so that a short buffer surfaces as `IncompleteFrame` rather than a panic.
pub trait PayloadCodec: Send + Sync + 'static {
    type Message: Message;

    fn encode(&self, message: &Self::Message, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    fn decode(&self, buf: &mut &[u8]) -> Result<Self::Message, ProtocolError>;
}

/// A message that carries its own wire format.
pub trait Wire: Message + Sized {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError>;
}

/// [`PayloadCodec`] for any [`Wire`] message.
pub struct WireCodec<M>(PhantomData<fn() -> M>);

impl<M> WireCodec<M> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<M> Default for WireCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Wire> PayloadCodec for WireCodec<M> {
    type Message = M;

    fn encode(&self, message: &M, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        message.encode_to(buf)
    }

    fn decode(&self, buf: &mut &[u8]) -> Result<M, ProtocolError> {
        M::decode_from(buf)
    }
}

type EncodeFn<M> = fn(&M, &mut BytesMut) -> Result<(), ProtocolError>;
type DecodeFn<M> = fn(&mut &[u8]) -> Result<M, ProtocolError>;

/// [`PayloadCodec`] built from a pair of functions.
pub struct FnCodec<M> {
    encode: EncodeFn<M>,
    decode: DecodeFn<M>,
}

impl<M: Message> PayloadCodec for FnCodec<M> {
    type Message = M;

    fn encode(&self, message: &M, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        (self.encode)(message, buf)
    }

    fn decode(&self, buf: &mut &[u8]) -> Result<M, ProtocolError> {
        (self.decode)(buf)
    }
}

/// Object-safe view of a [`PayloadCodec`].
trait ErasedPayload: Send + Sync {
    fn encode(&self, message: &dyn Message, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    fn decode(&self, buf: &mut &[u8]) -> Result<Box<dyn Message>, ProtocolError>;
}

impl<C: PayloadCodec> ErasedPayload for C {
    fn encode(&self, message: &dyn Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let typed = message.downcast_ref::<C::Message>().ok_or_else(|| {
            ProtocolError::MessageTypeMismatch {
                expected: MessageType::of::<C::Message>().name(),
                actual: message.message_type().name(),
            }
        })?;
        PayloadCodec::encode(self, typed, buf)
    }

    fn decode(&self, buf: &mut &[u8]) -> Result<Box<dyn Message>, ProtocolError> {
        let message = PayloadCodec::decode(self, buf)?;
        Ok(Box::new(message))
    }
}

/// An opcode bound to the codec for exactly one message type.
///
/// Immutable once built; owned by a
/// [`CodecLookupService`](crate::lookup::CodecLookupService).
pub struct MessageCodec {
    opcode: Opcode,
    message_type: MessageType,
    payload: Box<dyn ErasedPayload>,
}

impl MessageCodec {
    /// Binds `codec` to `opcode`.
    pub fn new<C: PayloadCodec>(opcode: impl Into<Opcode>, codec: C) -> Self {
        Self {
            opcode: opcode.into(),
            message_type: MessageType::of::<C::Message>(),
            payload: Box::new(codec),
        }
    }

    /// Binds a [`Wire`] message to `opcode`.
    pub fn wire<M: Wire>(opcode: impl Into<Opcode>) -> Self {
        Self::new(opcode, WireCodec::<M>::new())
    }

    /// Binds a pair of encode/decode functions to `opcode`.
    pub fn from_fns<M: Message>(
        opcode: impl Into<Opcode>,
        encode: EncodeFn<M>,
        decode: DecodeFn<M>,
    ) -> Self {
        Self::new(opcode, FnCodec { encode, decode })
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Encodes `message` as payload bytes (no framing).
    pub fn encode(&self, message: &dyn Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        self.payload.encode(message, buf)
    }

    /// Decodes one message from the front of `buf`.
    pub fn decode(&self, buf: &mut &[u8]) -> Result<Box<dyn Message>, ProtocolError> {
        self.payload.decode(buf)
    }
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("opcode", &self.opcode)
            .field("message_type", &self.message_type)
            .finish()
    }
}
