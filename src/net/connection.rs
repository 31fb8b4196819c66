//! Accepted or established connections.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry endpoint metadata next to the byte stream
//! - Hide the concrete stream type (TCP, unix, vsock, TLS) from the packet layer

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::bind::TransportKind;
use crate::tls::TlsSessionInfo;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Either side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum Endpoint {
    Inet { address: SocketAddr },
    Path { path: String },
    Vsock { cid: u32, port: u32 },
    Pipe { name: String },
    Unknown,
}

impl Endpoint {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Inet { address } => Some(*address),
            _ => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(address: SocketAddr) -> Self {
        Endpoint::Inet { address }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet { address } => write!(f, "{}", address),
            Endpoint::Path { path } => f.write_str(path),
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
            Endpoint::Pipe { name } => f.write_str(name),
            Endpoint::Unknown => f.write_str("unknown"),
        }
    }
}

/// Byte stream a connection can wrap.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A bidirectional byte channel plus what is known about it.
pub struct Connection {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub local: Endpoint,
    pub peer: Endpoint,
    /// Present once a TLS handshake completed on this connection.
    pub tls: Option<TlsSessionInfo>,
    stream: Box<dyn AsyncStream>,
}

impl Connection {
    pub fn new(kind: TransportKind, local: Endpoint, peer: Endpoint, stream: impl AsyncStream + 'static) -> Self {
        Self {
            id: ConnectionId::new(),
            kind,
            local,
            peer,
            tls: None,
            stream: Box::new(stream),
        }
    }

    pub fn into_stream(self) -> Box<dyn AsyncStream> {
        self.stream
    }

    /// Split into metadata and stream, e.g. to run a handshake over the stream.
    pub fn into_parts(self) -> (ConnectionMeta, Box<dyn AsyncStream>) {
        let meta = ConnectionMeta {
            id: self.id,
            kind: self.kind,
            local: self.local,
            peer: self.peer,
        };
        (meta, self.stream)
    }

    /// Reassemble with a (possibly wrapped) stream.
    pub fn from_parts(meta: ConnectionMeta, stream: impl AsyncStream + 'static, tls: Option<TlsSessionInfo>) -> Self {
        Self {
            id: meta.id,
            kind: meta.kind,
            local: meta.local,
            peer: meta.peer,
            tls,
            stream: Box::new(stream),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Connection metadata without the stream.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: ConnectionId,
    pub kind: TransportKind,
    pub local: Endpoint,
    pub peer: Endpoint,
}

impl AsyncRead for Connection {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_connection_is_a_byte_channel() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(TransportKind::Tcp, Endpoint::Unknown, Endpoint::Unknown, server);
        let mut client = client;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let (meta, stream) = conn.into_parts();
        let mut conn = Connection::from_parts(meta, stream, None);
        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
