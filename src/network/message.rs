//! Network message types for P2P communication
//!
//! Only the messages the connection manager itself understands are defined
//! here. Transaction payloads travel as opaque bytes.

use crate::network::address::{NetAddr, ServiceFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 60_014;

/// Oldest protocol version we talk to
pub const MIN_PROTOCOL_VERSION: u32 = 60_001;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x4D, 0x49, 0x4E, 0x49]; // "MINI"

/// Largest frame body accepted from the wire
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Addresses allowed in a single `Addr` message
pub const MAX_ADDR_PER_MESSAGE: usize = 1000;

/// Items allowed in a single `Inv`/`GetData` message
pub const MAX_INV_PER_MESSAGE: usize = 50_000;

// =============================================================================
// Inventory
// =============================================================================

/// Kind of announced content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InvType {
    Tx,
    Block,
}

/// Content identifier used for announcements, requests and the relay cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvItem {
    pub inv_type: InvType,
    /// Hex encoded double SHA-256 of the payload
    pub hash: String,
}

impl InvItem {
    pub fn new(inv_type: InvType, hash: impl Into<String>) -> Self {
        Self {
            inv_type,
            hash: hash.into(),
        }
    }

    /// Identifier of a transaction payload
    pub fn for_payload(inv_type: InvType, payload: &[u8]) -> Self {
        let first = Sha256::digest(payload);
        let second = Sha256::digest(first);
        Self::new(inv_type, hex::encode(second))
    }
}

impl fmt::Display for InvItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inv_type {
            InvType::Tx => "tx",
            InvType::Block => "block",
        };
        let short = self.hash.get(..16).unwrap_or(&self.hash);
        write!(f, "{} {}", kind, short)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Opening message of the handshake
    Version(VersionMessage),

    /// Handshake acknowledgement
    VerAck,

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),

    /// Request known addresses
    GetAddr,

    /// Gossiped peer addresses
    Addr(Vec<NetAddr>),

    /// Announce available content
    Inv(Vec<InvItem>),

    /// Request announced content
    GetData(Vec<InvItem>),

    /// Requested content is not available
    NotFound(Vec<InvItem>),

    /// Transaction payload
    Tx { item: InvItem, payload: Vec<u8> },

    /// Token the remote should present when it reconnects to us
    Token(u64),
}

/// Handshake payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Protocol version
    pub version: u32,
    /// Services offered by the sender
    pub services: ServiceFlags,
    /// Sender's clock (unix seconds)
    pub timestamp: i64,
    /// Address of the receiver as seen by the sender
    pub addr_recv: SocketAddr,
    /// Sender's best local address, if it has one
    pub addr_from: Option<SocketAddr>,
    /// Random nonce used to detect connections to ourselves
    pub nonce: u64,
    /// Sender's user agent string
    pub user_agent: String,
    /// Sender's chain height
    pub start_height: i64,
    /// Token previously issued by the receiver, proving a past connection
    pub reconnect_token: Option<u64>,
}

impl VersionMessage {
    pub fn new(
        services: ServiceFlags,
        addr_recv: SocketAddr,
        addr_from: Option<SocketAddr>,
        nonce: u64,
        start_height: i64,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp: crate::network::unix_time(),
            addr_recv,
            addr_from,
            nonce,
            user_agent: format!("mini-node/{}", env!("CARGO_PKG_VERSION")),
            start_height,
            reconnect_token: None,
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Version(_) => "Version",
            Message::VerAck => "VerAck",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::GetAddr => "GetAddr",
            Message::Addr(_) => "Addr",
            Message::Inv(_) => "Inv",
            Message::GetData(_) => "GetData",
            Message::NotFound(_) => "NotFound",
            Message::Tx { .. } => "Tx",
            Message::Token(_) => "Token",
        }
    }
}
