//! Listening sockets and wire framing
//!
//! Accepts incoming peer connections and frames messages on the byte
//! streams the event loop moves in and out of peer buffers.

use crate::network::message::{Message, MAGIC, MAX_MESSAGE_SIZE};
use crate::network::socket::{Listener, PeerSocket};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header: magic (4) + body length (4)
pub const HEADER_LEN: usize = 8;

/// Message codec for length-prefixed framing
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    /// Append one framed message to `dst`
    pub fn encode_message(msg: &Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        let data = msg
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} message too large: {} bytes", msg.type_name(), data.len()),
            ));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_message(&item, dst)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Check magic
        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        // Get length
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Oversized message: {} bytes", len),
            ));
        }

        // Check if we have full message
        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }

        // Skip header
        src.advance(HEADER_LEN);

        // Extract message data
        let data = src.split_to(len);

        // Deserialize
        let msg = Message::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }
}

/// TCP server for accepting peer connections
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Server listening on {}", addr);

        Ok(Self { listener, addr })
    }

    /// Get the bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for Server {
    async fn accept(&self) -> io::Result<(Arc<dyn PeerSocket>, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Arc::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
