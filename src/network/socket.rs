//! Socket abstractions
//!
//! The event loop only needs readiness plus non-blocking reads and writes,
//! so peers hold their stream behind [`PeerSocket`]. Outbound dials go
//! through a [`Dialer`] that runs on the connecting task, never on the
//! event loop.

use crate::network::peer::PeerError;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;

/// Non-blocking byte stream owned by a peer
#[async_trait]
pub trait PeerSocket: Send + Sync + fmt::Debug {
    /// Wait until the socket is ready for any of `interest`
    async fn ready(&self, interest: Interest) -> io::Result<Ready>;

    /// Read without blocking; `WouldBlock` when nothing is buffered
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write without blocking; `WouldBlock` when the kernel buffer is full
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl PeerSocket for TcpStream {
    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        TcpStream::ready(self, interest).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Source of inbound connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next connection; must be cancel safe
    async fn accept(&self) -> io::Result<(Arc<dyn PeerSocket>, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Errors that leave the socket usable and are retried next iteration
pub fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

// =============================================================================
// Dialing
// =============================================================================

/// What to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// A resolved address
    Addr(SocketAddr),
    /// A "host:port" destination, resolved by the dialer or the proxy
    Name(String),
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Addr(addr) => write!(f, "{}", addr),
            DialTarget::Name(name) => f.write_str(name),
        }
    }
}

/// Opens outbound connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        target: &DialTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn PeerSocket>, PeerError>;
}

/// TCP dialer, optionally through a SOCKS5 proxy
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    proxy: Option<SocketAddr>,
}

impl TcpDialer {
    pub fn new(proxy: Option<SocketAddr>) -> Self {
        Self { proxy }
    }

    async fn connect(&self, target: &DialTarget) -> Result<TcpStream, PeerError> {
        let stream = match (self.proxy, target) {
            (Some(proxy), DialTarget::Addr(addr)) => {
                tokio_socks::tcp::Socks5Stream::connect(proxy, *addr)
                    .await
                    .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?
                    .into_inner()
            }
            (Some(proxy), DialTarget::Name(name)) => {
                tokio_socks::tcp::Socks5Stream::connect(proxy, name.as_str())
                    .await
                    .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?
                    .into_inner()
            }
            (None, DialTarget::Addr(addr)) => TcpStream::connect(addr)
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?,
            (None, DialTarget::Name(name)) => TcpStream::connect(name.as_str())
                .await
                .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        target: &DialTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn PeerSocket>, PeerError> {
        match tokio::time::timeout(timeout, self.connect(target)).await {
            Ok(Ok(stream)) => Ok(Arc::new(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PeerError::Timeout(target.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(is_transient(io::ErrorKind::WouldBlock));
        assert!(is_transient(io::ErrorKind::Interrupted));
        assert!(!is_transient(io::ErrorKind::ConnectionReset));
        assert!(!is_transient(io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_tcp_dialer_connects_and_moves_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = TcpDialer::new(None);
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let socket = dialer
            .dial(&DialTarget::Addr(addr), Duration::from_secs(5))
            .await
            .unwrap();
        let remote = accept.await.unwrap();

        socket.ready(Interest::WRITABLE).await.unwrap();
        assert_eq!(socket.try_write(b"ping").unwrap(), 4);

        remote.readable().await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(remote.try_read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[tokio::test]
    async fn test_tcp_dialer_reports_refused() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let dialer = TcpDialer::new(None);
        let target = DialTarget::Addr(SocketAddr::from(([127, 0, 0, 1], port)));

        let result = dialer.dial(&target, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(PeerError::ConnectionFailed(_))));
    }
}
