//! Packet Buffer
//!
//! Growable byte buffer with a forward-only read cursor. Integers and floats
//! are encoded little-endian at fixed width; strings carry a 4-byte
//! little-endian length prefix followed by ASCII bytes. Raw byte writes carry
//! no framing at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const INT16_SIZE: usize = 2;
const INT32_SIZE: usize = 4;
const INT64_SIZE: usize = 8;
const FLOAT32_SIZE: usize = 4;

/// Errors raised by packet encoding and decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// A read asked for more bytes than remain unread.
    #[error("read of {requested} bytes exceeds the {remaining} unread bytes")]
    Boundary { requested: usize, remaining: usize },
    #[error("non-ASCII character at byte {index}")]
    NonAscii { index: usize },
    #[error("string of {len} bytes does not fit a 32-bit length prefix")]
    StringTooLong { len: usize },
    #[error("negative string length prefix: {0}")]
    NegativeLength(i32),
}

/// Text decoding applied to string payloads on read.
///
/// Writes are always ASCII; the encoding only matters when a peer wrote
/// bytes outside that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// Bytes above 0x7F decode to `?`.
    #[default]
    Ascii,
    /// Invalid sequences decode to U+FFFD.
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { '?' })
                .collect(),
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Byte buffer with typed writers and cursor-based readers.
///
/// Writes append and never move the cursor. Reads advance the cursor and
/// keep the bytes. `read_*` methods fail with [`PacketError::Boundary`] when
/// too few bytes remain; `try_read_*` methods return `None` instead and leave
/// the cursor where it was (see [`PacketBuffer::try_read_string`] for the one
/// exception).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBuffer {
    bytes: BytesMut,
    read_cursor: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PacketBuffer {
            bytes: BytesMut::with_capacity(capacity),
            read_cursor: 0,
        }
    }

    /// Total number of bytes held, read or not
    pub fn buffer_size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of bytes after the read cursor
    pub fn unread_size(&self) -> usize {
        self.bytes.len() - self.read_cursor
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Copy of the whole buffer, ready to be sent as one datagram.
    pub fn to_array(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bytes)
    }

    /// Drop all bytes and rewind the cursor.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.read_cursor = 0;
    }

    // --- writers ---

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.bytes.put_slice(data);
    }

    pub fn write_int16(&mut self, value: i16) {
        self.bytes.put_i16_le(value);
    }

    pub fn write_int32(&mut self, value: i32) {
        self.bytes.put_i32_le(value);
    }

    pub fn write_int64(&mut self, value: i64) {
        self.bytes.put_i64_le(value);
    }

    pub fn write_float32(&mut self, value: f32) {
        self.bytes.put_f32_le(value);
    }

    /// Write a length-prefixed ASCII string.
    ///
    /// `None` writes nothing at all, not even a length prefix. Strings with
    /// any non-ASCII character are rejected before a single byte is written.
    pub fn write_string<'a>(&mut self, value: impl Into<Option<&'a str>>) -> Result<(), PacketError> {
        let Some(value) = value.into() else {
            return Ok(());
        };

        if let Some(index) = value.bytes().position(|b| !b.is_ascii()) {
            return Err(PacketError::NonAscii { index });
        }
        let len = i32::try_from(value.len())
            .map_err(|_| PacketError::StringTooLong { len: value.len() })?;

        self.write_int32(len);
        self.bytes.put_slice(value.as_bytes());
        Ok(())
    }

    // --- readers ---

    fn ensure_unread(&self, requested: usize) -> Result<(), PacketError> {
        let remaining = self.unread_size();
        if requested > remaining {
            return Err(PacketError::Boundary {
                requested,
                remaining,
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, size: usize) -> Result<Bytes, PacketError> {
        self.ensure_unread(size)?;
        let start = self.read_cursor;
        self.read_cursor += size;
        Ok(Bytes::copy_from_slice(&self.bytes[start..self.read_cursor]))
    }

    pub fn read_int16(&mut self) -> Result<i16, PacketError> {
        Ok(self.read_bytes(INT16_SIZE)?.get_i16_le())
    }

    pub fn read_int32(&mut self) -> Result<i32, PacketError> {
        Ok(self.read_bytes(INT32_SIZE)?.get_i32_le())
    }

    pub fn read_int64(&mut self) -> Result<i64, PacketError> {
        Ok(self.read_bytes(INT64_SIZE)?.get_i64_le())
    }

    pub fn read_float32(&mut self) -> Result<f32, PacketError> {
        Ok(self.read_bytes(FLOAT32_SIZE)?.get_f32_le())
    }

    /// Read an ASCII string.
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        self.read_string_with(TextEncoding::Ascii)
    }

    /// Read a length-prefixed string decoded with `encoding`.
    ///
    /// The prefix is consumed before the payload is checked, so a short
    /// payload leaves the cursor 4 bytes further on.
    pub fn read_string_with(&mut self, encoding: TextEncoding) -> Result<String, PacketError> {
        let length = self.read_int32()?;
        let size = usize::try_from(length).map_err(|_| PacketError::NegativeLength(length))?;
        let data = self.read_bytes(size)?;
        Ok(encoding.decode(&data))
    }

    pub fn try_read_bytes(&mut self, size: usize) -> Option<Bytes> {
        if size > self.unread_size() {
            return None;
        }
        self.read_bytes(size).ok()
    }

    pub fn try_read_int16(&mut self) -> Option<i16> {
        if INT16_SIZE > self.unread_size() {
            return None;
        }
        self.read_int16().ok()
    }

    pub fn try_read_int32(&mut self) -> Option<i32> {
        if INT32_SIZE > self.unread_size() {
            return None;
        }
        self.read_int32().ok()
    }

    pub fn try_read_int64(&mut self) -> Option<i64> {
        if INT64_SIZE > self.unread_size() {
            return None;
        }
        self.read_int64().ok()
    }

    pub fn try_read_float32(&mut self) -> Option<f32> {
        if FLOAT32_SIZE > self.unread_size() {
            return None;
        }
        self.read_float32().ok()
    }

    /// Fallible ASCII string read, wire-compatible with existing peers.
    ///
    /// Two quirks are kept on purpose:
    /// - fewer than 4 unread bytes yields `Some("")` (reported as success)
    /// - a payload shorter than its prefix yields `None`, but the 4 prefix
    ///   bytes stay consumed
    ///
    /// Use [`PacketBuffer::try_read_string_strict`] for plain all-or-nothing
    /// behaviour.
    pub fn try_read_string(&mut self) -> Option<String> {
        self.try_read_string_with(TextEncoding::Ascii)
    }

    pub fn try_read_string_with(&mut self, encoding: TextEncoding) -> Option<String> {
        let Some(length) = self.try_read_int32() else {
            return Some(String::new());
        };
        let size = usize::try_from(length).ok()?;
        if size > self.unread_size() {
            return None;
        }
        self.read_bytes(size).ok().map(|data| encoding.decode(&data))
    }

    /// Fallible ASCII string read that fails on a missing prefix as well and
    /// rewinds past the prefix when the payload is short.
    pub fn try_read_string_strict(&mut self) -> Option<String> {
        let start = self.read_cursor;
        let length = self.try_read_int32()?;
        match usize::try_from(length) {
            Ok(size) if size <= self.unread_size() => self
                .read_bytes(size)
                .ok()
                .map(|data| TextEncoding::Ascii.decode(&data)),
            _ => {
                self.read_cursor = start;
                None
            }
        }
    }
}

impl From<&[u8]> for PacketBuffer {
    fn from(data: &[u8]) -> Self {
        PacketBuffer {
            bytes: BytesMut::from(data),
            read_cursor: 0,
        }
    }
}
