//! Error taxonomy shared by the listener, probe and TLS subsystems.
//!
//! # Design Decisions
//! - `ConfigurationError` is fatal and never retried
//! - Socket creation failures are aggregated so one report names every endpoint
//! - Errors carry owned strings so they can be cloned into logs and tests

use std::fmt;

use thiserror::Error;

use crate::bind::TransportKind;
use crate::net::probe::SocketPathState;
use crate::tls::HandshakeFailure;

/// Invalid user input: bind specs, TLS vocabulary, certificate locations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The `:` between host and port is missing.
    #[error("invalid bind spec '{spec}': port must be specified as [HOST]:PORT")]
    MissingPort { spec: String },

    /// The port is not a number in 0..=65535.
    #[error("invalid port number '{port}' in bind spec '{spec}'")]
    InvalidPort { spec: String, port: String },

    /// A non-zero port below the configured minimum.
    #[error("invalid port {port} in '{spec}': lower than the minimum of {min_port}")]
    PortBelowMinimum { spec: String, port: u16, min_port: u16 },

    /// A vsock context id that is neither numeric nor a known name.
    #[error("invalid vsock cid '{cid}'")]
    InvalidVsockCid { cid: String },

    /// `auto` or a directory spec needs a display name.
    #[error("socket spec '{spec}' needs a display name")]
    MissingDisplayName { spec: String },

    /// An option entry without `=`.
    #[error("invalid option '{entry}' in bind spec '{spec}', expected KEY=VALUE")]
    InvalidOption { spec: String, entry: String },

    /// Abstract socket names are limited to alphanumerics, `-` and `_`.
    #[error("invalid character in abstract socket name '{name}'")]
    InvalidAbstractName { name: String },

    /// The socket permission string is not a valid octal mode.
    #[error("invalid socket permissions '{value}': {reason}")]
    InvalidPermissions { value: String, reason: String },

    /// A token outside one of the fixed TLS vocabularies.
    #[error("invalid {what} '{token}', must be one of: {valid}")]
    UnknownToken {
        what: &'static str,
        token: String,
        valid: String,
    },

    /// Server-side TLS without a certificate and none found in the search path.
    #[error("you must specify an 'ssl-cert' file to use ssl sockets")]
    MissingCertificate,

    /// `auto` certificate lookup found nothing.
    #[error("failed to automatically locate an SSL certificate to use")]
    CertificateNotFound,

    /// Client-side hostname verification requested without a name to verify.
    #[error("ssl error: check-hostname is set but server-hostname is not")]
    HostnameCheckWithoutHostname,

    /// The server hostname cannot be used as a TLS server name.
    #[error("invalid server hostname '{0}'")]
    InvalidServerHostname(String),

    /// A file named by the configuration could not be read.
    #[error("failed to read '{path}': {reason}")]
    Unreadable { path: String, reason: String },

    /// A PEM file without the expected item.
    #[error("no {what} found in '{path}'")]
    EmptyPem { what: &'static str, path: String },

    /// Encrypted private keys are not supported.
    #[error("private key in '{path}' is encrypted, a decrypted key is required")]
    EncryptedKey { path: String },

    /// The `ca-certs` path does not exist.
    #[error("ssl ca-certs '{0}' does not exist")]
    MissingCaCerts(String),

    /// Inline `ca-data` could not be decoded.
    #[error("invalid ca-data: {0}")]
    InvalidCaData(String),

    /// rustls rejected the assembled configuration.
    #[error("tls configuration rejected: {0}")]
    Tls(String),
}

/// One endpoint that could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub kind: TransportKind,
    pub endpoint: String,
    pub error: String,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.endpoint, self.error)
    }
}

/// Every endpoint of a batch that still failed after the last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketCreationError {
    pub failures: Vec<EndpointFailure>,
}

impl SocketCreationError {
    pub fn single(kind: TransportKind, endpoint: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            failures: vec![EndpointFailure {
                kind,
                endpoint: endpoint.into(),
                error: error.to_string(),
            }],
        }
    }
}

impl fmt::Display for SocketCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<String> = {
            let mut kinds: Vec<String> = self.failures.iter().map(|e| e.kind.to_string()).collect();
            kinds.dedup();
            kinds
        };
        write!(f, "failed to create {} socket", kinds.join("/"))?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i == 0 {
                write!(f, ": ")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for SocketCreationError {}

/// A local socket path is owned by a running (or unreachable) server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", describe_conflict(.path, *.state))]
pub struct SocketConflictError {
    pub path: String,
    pub state: SocketPathState,
}

fn describe_conflict(path: &str, state: SocketPathState) -> String {
    match state {
        SocketPathState::Inaccessible => format!("cannot access the socket '{}'", path),
        _ => format!("a server is already running at '{}'", path),
    }
}

/// Anything that stops the listener set from coming up.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Creation(#[from] SocketCreationError),

    #[error(transparent)]
    Conflict(#[from] SocketConflictError),
}

/// Failure of an outgoing (client side) connection attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The TCP connection itself failed or timed out.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Handshake(#[from] HandshakeFailure),

    /// The peer closed the connection during the handshake.
    #[error("connection to {endpoint} closed during the TLS handshake")]
    Disconnected { endpoint: String },

    /// The trust store could not be read or updated.
    #[error("trust store error for {endpoint}: {source}")]
    TrustStore {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}
