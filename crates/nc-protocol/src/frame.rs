//! Frame header encoding/decoding
//!
//! Every frame starts with a 4-byte header:
//! - message_type: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Frame header carrying the message type and payload length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Type of message in the payload
    pub message_type: MessageType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            message_type,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.message_type.as_u8());
        // 24-bit length
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the message type is unknown; nothing is consumed in that case.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = src[0];
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        src.advance(1);
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;

        Ok(Some(Self {
            message_type,
            payload_length: (len_high << 16) | len_low,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(MessageType::Hello, 0x01_02_03);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        assert_eq!(&buf[..], &[MessageType::Hello.as_u8(), 0x01, 0x02, 0x03]);
        assert_eq!(FrameHeader::decode(&mut buf).unwrap(), Some(header));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(MessageType::Data, MAX_PAYLOAD_SIZE as u32);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[MessageType::Ping.as_u8(), 0, 0][..]);
        assert!(FrameHeader::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_unknown_message_type_consumes_nothing() {
        let mut buf = BytesMut::from(&[0xFE, 0, 0, 10][..]);
        let result = FrameHeader::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(0xFE))));
        assert_eq!(buf.len(), HEADER_SIZE);
    }
}
