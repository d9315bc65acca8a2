//! Binary wire primitives
//!
//! Integers are little-endian `i32`, strings are a 7-bit varint byte length
//! followed by UTF-8.

use crate::stream::Channel;
use crate::ProtocolError;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Buffered writer for one outgoing message
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a single byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Write a little-endian `i32`
    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    /// Write a count or length as `i32`
    pub fn put_len(&mut self, len: usize) -> Result<&mut Self, ProtocolError> {
        let len = i32::try_from(len)
            .map_err(|_| ProtocolError::Unsupported(format!("length {} exceeds i32", len)))?;
        Ok(self.put_i32(len))
    }

    /// Write a 7-bit varint
    pub fn put_varint(&mut self, mut value: u32) -> &mut Self {
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
        self
    }

    /// Write a length-prefixed UTF-8 string
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_varint(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Write raw bytes without a prefix
    pub fn put_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View the written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the message
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Source of wire bytes, either a live channel or an in-memory buffer
#[async_trait]
pub trait ByteSource: Send {
    /// Read exactly `n` bytes
    async fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError>;

    /// Read a single byte
    async fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let bytes = self.read_bytes(1).await?;
        Ok(bytes[0])
    }

    /// Read a little-endian `i32`
    async fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let mut bytes = self.read_bytes(4).await?;
        Ok(bytes.get_i32_le())
    }

    /// Read a non-negative `i32` count or length
    async fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_i32().await?;
        usize::try_from(len).map_err(|_| ProtocolError::InvalidFrame(format!("negative length {}", len)))
    }

    /// Read a 7-bit varint
    async fn read_varint(&mut self) -> Result<u32, ProtocolError> {
        let mut value = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8().await?;
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::InvalidFrame("varint longer than 5 bytes".into()))
    }

    /// Read a length-prefixed UTF-8 string
    async fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_varint().await? as usize;
        let bytes = self.read_bytes(len).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

#[async_trait]
impl ByteSource for Channel {
    async fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        self.read_exact(n).await
    }
}

/// In-memory byte source
#[derive(Debug, Clone, Default)]
pub struct BufferSource {
    buf: Bytes,
}

impl BufferSource {
    /// Read from a finished message
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[async_trait]
impl ByteSource for BufferSource {
    async fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::InvalidFrame(format!(
                "needed {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        Ok(self.buf.split_to(n))
    }
}
