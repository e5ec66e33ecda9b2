//! Checked reads and writes over `bytes` buffers.
//!
//! The `bytes::Buf` getters panic when the buffer runs short. Payloads come
//! off the wire, so codecs read through [`BufExt`] instead, which reports a
//! short buffer as [`ProtocolError::IncompleteFrame`].
//!
//! All fixed-width integers are big-endian. Strings are a u16 byte length
//! followed by UTF-8.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes};

/// Maximum encoded length of a u32 LEB128 varint.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest value the final byte of a u32 varint may carry.
const VARINT_LAST_BYTE_MAX: u8 = 0x0F;

/// Maximum byte length of a length-prefixed string.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Checked reads for any [`Buf`].
pub trait BufExt: Buf {
    /// Fails unless at least `len` bytes remain.
    fn ensure(&self, len: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        if remaining < len {
            return Err(ProtocolError::IncompleteFrame {
                needed: len - remaining,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.get_u32())
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.get_i32())
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.get_u64())
    }

    fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads an unsigned LEB128 varint of at most [`MAX_VARINT_LEN`] bytes.
    fn read_var_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut value = 0u32;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8()?;
            if i == MAX_VARINT_LEN - 1 && byte & 0x7F > VARINT_LAST_BYTE_MAX {
                return Err(ProtocolError::VarIntOverflow);
            }
            value |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarIntTooLong {
            max_bytes: MAX_VARINT_LEN,
        })
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(len)?;
        Ok(self.copy_to_bytes(len))
    }

    /// Reads a u16-length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads a u16 count followed by that many strings.
    fn read_string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.read_u16()? as usize;
        // Each entry needs at least its two length bytes.
        self.ensure(count * 2)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.read_string()?);
        }
        Ok(items)
    }
}

impl<B: Buf + ?Sized> BufExt for B {}

/// Writers matching the [`BufExt`] readers.
pub trait BufMutExt: BufMut {
    fn put_var_u32(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.put_u8(byte);
                return;
            }
            self.put_u8(byte | 0x80);
        }
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong {
            len: value.len(),
            max: MAX_STRING_LEN,
        })?;
        self.put_u16(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    fn put_string_list(&mut self, items: &[String]) -> Result<(), ProtocolError> {
        let count = u16::try_from(items.len()).map_err(|_| ProtocolError::StringTooLong {
            len: items.len(),
            max: MAX_STRING_LEN,
        })?;
        self.put_u16(count);
        for item in items {
            self.put_string(item)?;
        }
        Ok(())
    }
}

impl<B: BufMut + ?Sized> BufMutExt for B {}

/// Returns the number of bytes `value` occupies as a varint.
pub fn var_u32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Peeks a varint at the start of `buf` without consuming it.
///
/// Returns `Ok(None)` when the varint is not yet complete, otherwise the
/// value and the number of bytes it occupies.
pub fn peek_var_u32(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut value = 0u32;
    for (i, byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 && byte & 0x7F > VARINT_LAST_BYTE_MAX {
            return Err(ProtocolError::VarIntOverflow);
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::VarIntTooLong {
            max_bytes: MAX_VARINT_LEN,
        });
    }
    Ok(None)
}
