//! # Remoting Protocol
//!
//! Framing, channel multiplexing and wire primitives for the remoting runtime.

#![warn(missing_docs)]

/// Frame structure and channel hashing
pub mod frame;

/// Command and value tags, type descriptors
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Channel multiplexing over a single physical stream
pub mod stream;

/// Binary wire primitives
pub mod wire;

/// Error types for protocol operations
pub mod error;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use frame::{channel_hash, Frame, MuxCommand};
pub use message::{names, Command, TypeDescriptor, ValueTag, COMMANDS_CHANNEL, EVENTS_CHANNEL};
pub use stream::{Channel, Multiplexer, MuxConfig, DEFAULT_PACKET_SIZE};
pub use wire::{BufferSource, ByteSource, WireWriter};
