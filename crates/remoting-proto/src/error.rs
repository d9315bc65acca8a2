//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O failure on the physical stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid frame format
    #[error("Invalid frame format: {0}")]
    InvalidFrame(String),

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Packet addressed to a channel that was never announced
    #[error("Unknown channel hash: {0:#010x}")]
    UnknownChannel(u32),

    /// Channel closed, locally or because the connection ended
    #[error("Channel closed")]
    ChannelClosed,

    /// Unknown command or value tag
    #[error("Invalid {kind} tag: {tag}")]
    InvalidTag {
        /// Which tag family was being decoded
        kind: &'static str,
        /// Raw tag byte
        tag: u8,
    },

    /// String payload is not valid UTF-8
    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8,

    /// Malformed or unexpected XML document
    #[error("XML error: {0}")]
    Xml(String),

    /// Value cannot be represented on the wire
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    /// Whether the error means the underlying connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Io(_))
    }
}
