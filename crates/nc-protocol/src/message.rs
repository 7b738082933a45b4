//! Message types for the Nectar agent protocol
//!
//! # Message Flow
//!
//! 1. The master authenticates over SSH as its organization and opens one
//!    session channel
//! 2. The master sends `Hello` carrying its property bag (the provisioning
//!    grant, if it has one, travels under [`PROPERTY_GRANT`])
//! 3. The orchestrator answers with `Accepted` or `Refused`; nothing else
//!    is allowed on the channel before this verdict
//! 4. Once accepted, `Ping`/`Pong` keep the channel alive and `Data`
//!    frames carry application traffic in both directions
//! 5. Either side may send `Close` before tearing the channel down

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Current protocol version string, sent in `Hello`.
///
/// Format: "MAJOR.MINOR" where MAJOR changes indicate breaking changes.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Property key carrying the one-time provisioning grant.
pub const PROPERTY_GRANT: &str = "grant";

/// String key/value properties supplied by a connecting master
pub type Properties = BTreeMap<String, String>;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Opening frame from the master
    Hello = 0x01,
    /// Approval verdict: accepted
    Accepted = 0x02,
    /// Approval verdict: refused
    Refused = 0x03,
    /// Keepalive ping
    Ping = 0x04,
    /// Keepalive reply
    Pong = 0x05,
    /// Application payload
    Data = 0x06,
    /// Orderly close notice
    Close = 0x07,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Accepted),
            0x03 => Some(Self::Refused),
            0x04 => Some(Self::Ping),
            0x05 => Some(Self::Pong),
            0x06 => Some(Self::Data),
            0x07 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Why a connection was refused.
///
/// The kind tells the master whether retrying makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalKind {
    /// Soft refusal (e.g. not approved yet); the master may retry later
    Graceful,
    /// Identity mismatch or invalid grant; needs operator intervention
    Security,
    /// The peer broke the handshake rules or named an unknown organization
    Protocol,
    /// The orchestrator hit an internal inconsistency
    Internal,
}

impl RefusalKind {
    /// Whether a master should retry after this kind of refusal
    pub fn is_retriable(&self) -> bool {
        matches!(self, RefusalKind::Graceful | RefusalKind::Internal)
    }
}

impl fmt::Display for RefusalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefusalKind::Graceful => write!(f, "graceful"),
            RefusalKind::Security => write!(f, "security"),
            RefusalKind::Protocol => write!(f, "protocol"),
            RefusalKind::Internal => write!(f, "internal"),
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First frame sent by a master after authenticating.
    Hello {
        /// Properties supplied by the master (grant, build info, ...)
        properties: Properties,
        /// Protocol version (e.g., "1.0"). Absent means 1.0.
        #[serde(default)]
        version: Option<String>,
    },

    /// The orchestrator approved the connection
    Accepted {
        /// Display name of the orchestrator
        orchestrator: String,
        /// Endpoint URL agents should use to locate the listener
        endpoint: Option<String>,
    },

    /// The orchestrator refused the connection
    Refused {
        /// Refusal category
        kind: RefusalKind,
        /// Human-readable reason
        reason: String,
    },

    /// Keepalive ping
    Ping {
        /// Timestamp for latency measurement
        timestamp: u64,
    },

    /// Keepalive reply
    Pong {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Opaque application payload
    Data(Bytes),

    /// Orderly close
    Close {
        /// Optional reason
        reason: Option<String>,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Accepted { .. } => MessageType::Accepted,
            Message::Refused { .. } => MessageType::Refused,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Data(_) => MessageType::Data,
            Message::Close { .. } => MessageType::Close,
        }
    }

    /// Build a `Hello` with the current protocol version
    pub fn hello(properties: Properties) -> Self {
        Message::Hello {
            properties,
            version: Some(PROTOCOL_VERSION.to_string()),
        }
    }

    /// Build a `Refused` verdict
    pub fn refused(kind: RefusalKind, reason: impl Into<String>) -> Self {
        Message::Refused {
            kind,
            reason: reason.into(),
        }
    }
}
