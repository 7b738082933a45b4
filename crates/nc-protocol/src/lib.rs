//! nc-protocol: Wire protocol for the Nectar agent channel
//!
//! This crate defines the framed messages exchanged between a master and
//! the orchestrator over the authenticated SSH channel: the opening
//! `Hello`, the approval verdict, and the traffic allowed afterwards.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::MessageCodec;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    Message, MessageType, Properties, RefusalKind, PROPERTY_GRANT, PROTOCOL_VERSION,
};
