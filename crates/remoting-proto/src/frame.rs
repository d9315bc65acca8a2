//! Frame structure and channel hashing

use bytes::{BufMut, Bytes, BytesMut};
use crate::ProtocolError;

/// Size of the fixed frame header: command byte plus channel hash
pub const HEADER_SIZE: usize = 5;

/// Size of the length prefix that follows the header of a packet frame
pub const LENGTH_SIZE: usize = 4;

/// Multiplexer command carried in the first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxCommand {
    /// Announce a channel
    CreateCanal = 0,
    /// Tear a channel down
    DestroyCanal = 1,
    /// Data for a channel
    Packet = 2,
}

impl TryFrom<u8> for MuxCommand {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::CreateCanal),
            1 => Ok(Self::DestroyCanal),
            2 => Ok(Self::Packet),
            _ => Err(ProtocolError::InvalidTag { kind: "mux command", tag }),
        }
    }
}

/// Hash a channel name into its 32-bit wire identifier (FNV-1a).
///
/// Both ends must agree on the function, so it is fixed rather than seeded.
pub fn channel_hash(name: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    name.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ byte as u32).wrapping_mul(PRIME))
}

/// One multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame command
    pub command: MuxCommand,
    /// Target channel hash
    pub channel: u32,
    /// Payload, only meaningful for packets
    pub payload: Bytes,
}

impl Frame {
    /// Create a channel announcement frame
    pub fn create(channel: u32) -> Self {
        Self {
            command: MuxCommand::CreateCanal,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Create a channel teardown frame
    pub fn destroy(channel: u32) -> Self {
        Self {
            command: MuxCommand::DestroyCanal,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn packet(channel: u32, payload: Bytes) -> Self {
        Self {
            command: MuxCommand::Packet,
            channel,
            payload,
        }
    }

    /// Number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self.command {
            MuxCommand::Packet => HEADER_SIZE + LENGTH_SIZE + self.payload.len(),
            _ => HEADER_SIZE,
        }
    }

    /// Append the wire representation of this frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.command as u8);
        buf.put_u32_le(self.channel);

        if self.command == MuxCommand::Packet {
            buf.put_u32_le(self.payload.len() as u32);
            buf.put_slice(&self.payload);
        }
    }

    /// Check if this is a data frame
    pub fn is_packet(&self) -> bool {
        self.command == MuxCommand::Packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_channel_hash_is_stable() {
        assert_eq!(channel_hash(""), 0x811c_9dc5);
        assert_eq!(channel_hash("a"), 0xe40c_292c);
        assert_eq!(channel_hash("Commands"), channel_hash("Commands"));
        assert_ne!(channel_hash("Commands"), channel_hash("Events"));
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(MuxCommand::try_from(0).unwrap(), MuxCommand::CreateCanal);
        assert_eq!(MuxCommand::try_from(1).unwrap(), MuxCommand::DestroyCanal);
        assert_eq!(MuxCommand::try_from(2).unwrap(), MuxCommand::Packet);
        assert!(matches!(
            MuxCommand::try_from(3),
            Err(ProtocolError::InvalidTag { tag: 3, .. })
        ));
    }

    #[test]
    fn test_control_frame_layout() {
        let frame = Frame::create(0x0403_0201);
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf);

        assert_eq!(&buf[..], &[0, 1, 2, 3, 4]);
        assert_eq!(frame.encoded_len(), HEADER_SIZE);
        assert!(!frame.is_packet());
    }

    #[test]
    fn test_packet_frame_layout() {
        let frame = Frame::packet(1, Bytes::from_static(b"hi"));
        let mut buf = BytesMut::new();
        frame.encode_into(&mut buf);

        assert_eq!(&buf[..], &[2, 1, 0, 0, 0, 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(frame.encoded_len(), buf.len());
    }

    proptest! {
        #[test]
        fn test_encoded_len_matches_buffer(
            channel in any::<u32>(),
            payload in prop::collection::vec(any::<u8>(), 0..512)
        ) {
            let frame = Frame::packet(channel, Bytes::from(payload));
            let mut buf = BytesMut::new();
            frame.encode_into(&mut buf);
            prop_assert_eq!(buf.len(), frame.encoded_len());
        }
    }
}
