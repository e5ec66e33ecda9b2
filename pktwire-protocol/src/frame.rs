//! Header layouts for packet framing.
//!
//! Every frame starts with an opcode. Layouts that carry a length put it
//! directly after the opcode; it counts payload bytes only.
//!
//! ```text
//! +--------+----------+----------------------+
//! | opcode | [length] | payload              |
//! | width  | width    | length bytes, or     |
//! |        |          | up to the codec when |
//! |        |          | there is no length   |
//! +--------+----------+----------------------+
//! ```
//!
//! Without a length field the end of a frame is only known to the codec that
//! decodes it, so an unrecognised opcode cannot be skipped.

use crate::buffer::{peek_var_u32, var_u32_len, BufMutExt};
use crate::codec::Opcode;
use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Width of an integer header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    U8,
    /// Big-endian.
    U16,
    /// Big-endian.
    U32,
    /// Unsigned LEB128, at most 5 bytes.
    VarInt,
}

impl IntWidth {
    /// Largest value the field can hold.
    pub fn max_value(&self) -> u32 {
        match self {
            IntWidth::U8 => u8::MAX as u32,
            IntWidth::U16 => u16::MAX as u32,
            IntWidth::U32 | IntWidth::VarInt => u32::MAX,
        }
    }

    /// Number of bytes `value` occupies in this field.
    pub fn encoded_len(&self, value: u32) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::VarInt => var_u32_len(value),
        }
    }

    /// Reads the field at the start of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` if the field is not complete yet, otherwise the
    /// value and its encoded length.
    pub fn peek(&self, buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
        let fixed = match self {
            IntWidth::VarInt => return peek_var_u32(buf),
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
        };
        if buf.len() < fixed {
            return Ok(None);
        }
        let value = match self {
            IntWidth::U8 => u32::from(buf[0]),
            IntWidth::U16 => u32::from(u16::from_be_bytes([buf[0], buf[1]])),
            _ => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        };
        Ok(Some((value, fixed)))
    }

    /// Writes `value`; the caller has checked it against [`max_value`](Self::max_value).
    fn put(&self, value: u32, buf: &mut BytesMut) {
        match self {
            IntWidth::U8 => buf.put_u8(value as u8),
            IntWidth::U16 => buf.put_u16(value as u16),
            IntWidth::U32 => buf.put_u32(value),
            IntWidth::VarInt => buf.put_var_u32(value),
        }
    }
}

impl fmt::Display for IntWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntWidth::U8 => write!(f, "u8"),
            IntWidth::U16 => write!(f, "u16"),
            IntWidth::U32 => write!(f, "u32"),
            IntWidth::VarInt => write!(f, "varint"),
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: Opcode,
    /// Bytes taken by the opcode and length fields.
    pub header_len: usize,
    /// Payload length, when the layout carries one.
    pub payload_len: Option<usize>,
}

impl FrameHeader {
    /// Total frame length, known only for length-prefixed layouts.
    pub fn frame_len(&self) -> Option<usize> {
        self.payload_len.map(|len| self.header_len + len)
    }
}

/// Result of peeking a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderPeek {
    Header(FrameHeader),
    /// At least this many more bytes are needed to read the header.
    Incomplete { needed: usize },
}

/// Byte layout of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    opcode: IntWidth,
    length: Option<IntWidth>,
    max_payload: usize,
}

impl FrameLayout {
    /// Opcode followed directly by the payload.
    pub const fn opcode_only(opcode: IntWidth) -> Self {
        Self {
            opcode,
            length: None,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Opcode, then payload length, then payload.
    pub const fn length_prefixed(opcode: IntWidth, length: IntWidth) -> Self {
        Self {
            opcode,
            length: Some(length),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn opcode_width(&self) -> IntWidth {
        self.opcode
    }

    pub fn length_width(&self) -> Option<IntWidth> {
        self.length
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether every frame's length can be read from its header.
    pub fn has_length(&self) -> bool {
        self.length.is_some()
    }

    /// Largest payload a frame can declare.
    fn payload_limit(&self) -> usize {
        match self.length {
            Some(width) => self.max_payload.min(width.max_value() as usize),
            None => self.max_payload,
        }
    }

    /// Parses the header at the start of `buf` without consuming it.
    pub fn peek_header(&self, buf: &[u8]) -> Result<HeaderPeek, ProtocolError> {
        let (opcode, opcode_len) = match self.opcode.peek(buf)? {
            Some(field) => field,
            None => return Ok(HeaderPeek::Incomplete { needed: 1 }),
        };

        let Some(length) = self.length else {
            return Ok(HeaderPeek::Header(FrameHeader {
                opcode: Opcode(opcode),
                header_len: opcode_len,
                payload_len: None,
            }));
        };

        let (payload_len, length_len) = match length.peek(&buf[opcode_len..])? {
            Some(field) => field,
            None => return Ok(HeaderPeek::Incomplete { needed: 1 }),
        };
        let payload_len = payload_len as usize;
        let limit = self.payload_limit();
        if payload_len > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: limit,
            });
        }

        Ok(HeaderPeek::Header(FrameHeader {
            opcode: Opcode(opcode),
            header_len: opcode_len + length_len,
            payload_len: Some(payload_len),
        }))
    }

    /// Builds a new frame: header followed by a copy of `payload`.
    pub fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if opcode.0 > self.opcode.max_value() {
            return Err(ProtocolError::OpcodeOutOfRange {
                opcode,
                width: self.opcode,
            });
        }
        let limit = self.payload_limit();
        if payload.len() > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: limit,
            });
        }

        let payload_len = payload.len() as u32;
        let header_len = self.opcode.encoded_len(opcode.0)
            + self.length.map_or(0, |width| width.encoded_len(payload_len));
        let mut buf = BytesMut::with_capacity(header_len + payload.len());

        self.opcode.put(opcode.0, &mut buf);
        if let Some(length) = self.length {
            length.put(payload_len, &mut buf);
        }
        buf.put_slice(payload);

        Ok(buf.freeze())
    }
}

impl fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.length {
            Some(length) => write!(f, "{} opcode + {} length", self.opcode, length),
            None => write!(f, "{} opcode, no length", self.opcode),
        }
    }
}
