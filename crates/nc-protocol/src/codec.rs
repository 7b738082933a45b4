//! Tokio codec for framed protocol messages

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// Codec for encoding/decoding protocol messages
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Header already consumed while waiting for its payload
    pending_header: Option<FrameHeader>,
}

impl MessageCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }

    /// Encode a single message into a fresh buffer
    pub fn encode_to_vec(message: Message) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode(message, &mut buf)?;
        Ok(buf.to_vec())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        tracing::trace!("Decoded {:?} frame ({} bytes)", header.message_type, payload_len);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        FrameHeader::new(message.message_type(), payload_len as u32).encode(dst);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
