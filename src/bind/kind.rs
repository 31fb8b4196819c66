//! Transport kinds and their per-kind defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Wire protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Plain TCP stream.
    Tcp,
    /// TLS over TCP.
    Ssl,
    /// TCP socket upgraded to SSH by a collaborator.
    Ssh,
    /// WebSocket.
    Ws,
    /// Secure WebSocket.
    Wss,
    /// VNC / RFB.
    Rfb,
    /// QUIC (UDP datagrams).
    Quic,
    /// Host/guest VM socket.
    Vsock,
    /// Unix domain socket path (or Linux abstract name).
    Socket,
    /// Windows named pipe.
    NamedPipe,
}

impl TransportKind {
    pub const ALL: [TransportKind; 10] = [
        TransportKind::Tcp,
        TransportKind::Ssl,
        TransportKind::Ssh,
        TransportKind::Ws,
        TransportKind::Wss,
        TransportKind::Rfb,
        TransportKind::Quic,
        TransportKind::Vsock,
        TransportKind::Socket,
        TransportKind::NamedPipe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ssl => "ssl",
            TransportKind::Ssh => "ssh",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Rfb => "rfb",
            TransportKind::Quic => "quic",
            TransportKind::Vsock => "vsock",
            TransportKind::Socket => "socket",
            TransportKind::NamedPipe => "named-pipe",
        }
    }

    /// Port used when a bind spec leaves the port empty.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            TransportKind::Tcp | TransportKind::Quic => Some(14500),
            TransportKind::Ssl | TransportKind::Wss => Some(443),
            TransportKind::Ssh => Some(22),
            TransportKind::Ws => Some(80),
            TransportKind::Rfb => Some(5900),
            TransportKind::Vsock | TransportKind::Socket | TransportKind::NamedPipe => None,
        }
    }

    /// Host:port stream listeners.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            TransportKind::Tcp
                | TransportKind::Ssl
                | TransportKind::Ssh
                | TransportKind::Ws
                | TransportKind::Wss
                | TransportKind::Rfb
        )
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, TransportKind::Quic)
    }

    /// Addressed by host and port.
    pub fn is_inet(&self) -> bool {
        self.is_stream() || self.is_datagram()
    }

    /// Connections must complete a TLS handshake before use.
    pub fn requires_tls(&self) -> bool {
        matches!(self, TransportKind::Ssl | TransportKind::Wss | TransportKind::Quic)
    }

    /// Kinds that may ask for a port-forwarding mapping.
    pub fn supports_port_mapping(&self) -> bool {
        matches!(
            self,
            TransportKind::Tcp | TransportKind::Ssl | TransportKind::Ssh | TransportKind::Ws | TransportKind::Wss
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        TransportKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lower)
            .ok_or_else(|| ConfigurationError::UnknownToken {
                what: "transport",
                token: s.to_string(),
                valid: TransportKind::ALL.map(|k| k.as_str()).join(", "),
            })
    }
}
