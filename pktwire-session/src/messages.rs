//! Messages shared by the built-in protocol versions.
//!
//! Payload layouts are the same in every version; only the opcodes and the
//! header framing differ. Strings are u16-length-prefixed UTF-8.

use bytes::{BufMut, BytesMut};
use pktwire_protocol::{impl_message, BufExt, BufMutExt, ProtocolError, Wire};

/// Liveness probe. The receiver answers with a [`Pong`] carrying the same nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u32,
}

/// Ends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    pub reason: String,
}

/// Remote command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvoke {
    pub command: String,
    pub args: Vec<String>,
}

/// First message of a session on versions that require one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub identity: String,
    /// Id of the protocol version the sender speaks.
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub text: String,
}

impl_message!(Ping, Pong, Kick, CommandInvoke, Introduction, Chat);

impl Wire for Ping {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.nonce);
        Ok(())
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            nonce: buf.read_u32()?,
        })
    }
}

impl Wire for Pong {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32(self.nonce);
        Ok(())
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            nonce: buf.read_u32()?,
        })
    }
}

impl Wire for Kick {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_string(&self.reason)
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: buf.read_string()?,
        })
    }
}

impl Wire for CommandInvoke {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_string(&self.command)?;
        buf.put_string_list(&self.args)
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        let command = buf.read_string()?;
        if command.is_empty() {
            return Err(ProtocolError::MalformedPayload {
                message: "CommandInvoke",
                reason: "empty command name".to_string(),
            });
        }
        Ok(Self {
            command,
            args: buf.read_string_list()?,
        })
    }
}

impl Wire for Introduction {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_string(&self.identity)?;
        buf.put_string(&self.protocol)
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            identity: buf.read_string()?,
            protocol: buf.read_string()?,
        })
    }
}

impl Wire for Chat {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_string(&self.text)
    }

    fn decode_from(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            text: buf.read_string()?,
        })
    }
}
