//! Frame codec for async streams

use crate::frame::{Frame, MuxCommand, HEADER_SIZE, LENGTH_SIZE};
use crate::ProtocolError;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame codec for encoding/decoding multiplexer frames over async streams
pub struct FrameCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum payload size allowed
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode a frame to bytes
    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode_into(&mut buf);
        Ok(buf.freeze())
    }

    /// Write a frame to an async writer
    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        frame: &Frame,
        flush: bool,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let encoded = self.encode_frame(frame)?;
        writer.write_all(&encoded).await?;
        if flush {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Read a frame from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.try_decode_frame()? {
                return Ok(Some(frame));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "stream ended inside a frame ({} bytes buffered)",
                        self.read_buf.len()
                    )));
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a frame from the internal buffer
    pub fn try_decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.read_buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let command = MuxCommand::try_from(self.read_buf[0])?;
        let channel = (&self.read_buf[1..HEADER_SIZE]).get_u32_le();

        if command != MuxCommand::Packet {
            self.read_buf.advance(HEADER_SIZE);
            return Ok(Some(Frame {
                command,
                channel,
                payload: Bytes::new(),
            }));
        }

        if self.read_buf.len() < HEADER_SIZE + LENGTH_SIZE {
            return Ok(None);
        }

        let len = (&self.read_buf[HEADER_SIZE..HEADER_SIZE + LENGTH_SIZE]).get_u32_le() as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < HEADER_SIZE + LENGTH_SIZE + len {
            return Ok(None);
        }

        self.read_buf.advance(HEADER_SIZE + LENGTH_SIZE);
        let payload = self.read_buf.split_to(len).freeze();

        Ok(Some(Frame::packet(channel, payload)))
    }
}
