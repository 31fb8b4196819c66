//! TLS handshake coordination and failure classification.
//!
//! # Data Flow
//! ```text
//! Connection ──▶ Handshake::secure ──▶ acceptor / connector (bounded by timeout)
//!                                          │
//!                    ┌─────────────────────┼─────────────────────┐
//!                    ▼                     ▼                     ▼
//!              Established           Disconnected         HandshakeFailure
//!         (Connection + session)   (peer went away)    (kind + verify code)
//! ```
//!
//! # Design Decisions
//! - A peer closing the socket mid-handshake is not a failure; it is logged
//!   at debug level and reported as `Disconnected`.
//! - Verification failures carry the X.509 verify code so callers can tell
//!   fixable trust problems apart from fatal ones.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{CertificateError, CommonState};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::net::Connection;
use crate::observability::metrics;
use crate::tls::certs;
use crate::tls::context::{HandshakeParams, TlsContext};
use crate::tls::policy::TlsSide;
use crate::tls::verifier::{is_name_mismatch, VerifyCodeError};

pub const VERIFY_EXPIRED: i32 = 10;
pub const VERIFY_SELF_SIGNED: i32 = 18;
pub const VERIFY_UNTRUSTED_ROOT: i32 = 19;
pub const VERIFY_WRONG_HOST: i32 = 20;
pub const VERIFY_HOSTNAME_MISMATCH: i32 = 62;
pub const VERIFY_IP_MISMATCH: i32 = 64;

/// Classified handshake failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Expired,
    WrongHost,
    SelfSigned,
    UntrustedRoot,
    IpMismatch,
    HostnameMismatch,
    Other(String),
}

impl FailureKind {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            VERIFY_EXPIRED => FailureKind::Expired,
            VERIFY_SELF_SIGNED => FailureKind::SelfSigned,
            VERIFY_UNTRUSTED_ROOT => FailureKind::UntrustedRoot,
            VERIFY_WRONG_HOST => FailureKind::WrongHost,
            VERIFY_HOSTNAME_MISMATCH => FailureKind::HostnameMismatch,
            VERIFY_IP_MISMATCH => FailureKind::IpMismatch,
            _ => return None,
        })
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            FailureKind::Expired => Some(VERIFY_EXPIRED),
            FailureKind::SelfSigned => Some(VERIFY_SELF_SIGNED),
            FailureKind::UntrustedRoot => Some(VERIFY_UNTRUSTED_ROOT),
            FailureKind::WrongHost => Some(VERIFY_WRONG_HOST),
            FailureKind::HostnameMismatch => Some(VERIFY_HOSTNAME_MISMATCH),
            FailureKind::IpMismatch => Some(VERIFY_IP_MISMATCH),
            FailureKind::Other(_) => None,
        }
    }

    /// Failures a user may override by trusting the certificate or
    /// disabling the hostname check.
    pub fn is_fixable(&self) -> bool {
        matches!(
            self,
            FailureKind::SelfSigned | FailureKind::WrongHost | FailureKind::IpMismatch | FailureKind::HostnameMismatch
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            FailureKind::Expired => "expired",
            FailureKind::WrongHost => "wrong-host",
            FailureKind::SelfSigned => "self-signed",
            FailureKind::UntrustedRoot => "untrusted-root",
            FailureKind::IpMismatch => "ip-mismatch",
            FailureKind::HostnameMismatch => "hostname-mismatch",
            FailureKind::Other(_) => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Other(reason) => write!(f, "{}", reason),
            kind => f.write_str(kind.as_str()),
        }
    }
}

/// A handshake that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SSL handshake failed: {message}")]
pub struct HandshakeFailure {
    pub kind: FailureKind,
    pub verify_code: Option<i32>,
    pub peer: Option<SocketAddr>,
    pub server_hostname: Option<String>,
    pub message: String,
}

impl HandshakeFailure {
    pub fn is_fixable(&self) -> bool {
        self.kind.is_fixable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Handshaking,
    Established,
    Failed,
}

/// Negotiated session details exposed on the secured connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsSessionInfo {
    pub version: String,
    pub cipher: String,
    pub server_hostname: Option<String>,
    pub peer_certificates: usize,
    pub peer_fingerprint: Option<String>,
}

impl TlsSessionInfo {
    fn from_state(state: &CommonState, server_hostname: Option<String>) -> Self {
        let peer = state.peer_certificates().unwrap_or(&[]);
        Self {
            version: state
                .protocol_version()
                .map(|v| format!("{:?}", v))
                .unwrap_or_default(),
            cipher: state
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite()))
                .unwrap_or_default(),
            server_hostname,
            peer_certificates: peer.len(),
            peer_fingerprint: peer.first().map(|cert| certs::fingerprint(cert.as_ref())),
        }
    }
}

#[derive(Debug)]
pub enum HandshakeOutcome<S> {
    Established(S, TlsSessionInfo),
    /// The peer closed the connection before the handshake completed.
    Disconnected,
}

/// Drives one handshake on one stream.
#[derive(Debug)]
pub struct Handshake {
    params: HandshakeParams,
    peer: Option<SocketAddr>,
    timeout: Duration,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(params: HandshakeParams, peer: Option<SocketAddr>, timeout: Duration) -> Self {
        Self {
            params,
            peer,
            timeout,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub async fn accept<S>(
        &mut self,
        acceptor: &TlsAcceptor,
        stream: S,
    ) -> Result<HandshakeOutcome<tokio_rustls::server::TlsStream<S>>, HandshakeFailure>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.begin()?;
        let result = tokio::time::timeout(self.timeout, acceptor.accept(stream)).await;
        let outcome = match result {
            Ok(Ok(tls)) => {
                let (_, conn) = tls.get_ref();
                let info = TlsSessionInfo::from_state(conn, conn.server_name().map(str::to_string));
                Ok(HandshakeOutcome::Established(tls, info))
            }
            Ok(Err(e)) => self.classify(e),
            Err(_) => Err(self.timed_out()),
        };
        self.finish(outcome)
    }

    pub async fn connect<S>(
        &mut self,
        connector: &TlsConnector,
        stream: S,
    ) -> Result<HandshakeOutcome<tokio_rustls::client::TlsStream<S>>, HandshakeFailure>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.begin()?;
        let server_name = match self.params.server_name.clone() {
            Some(name) => name,
            None => {
                let failure = self.failure(FailureKind::Other("no server name to connect to".to_string()), None);
                return self.finish(Err(failure));
            }
        };
        let result = tokio::time::timeout(self.timeout, connector.connect(server_name, stream)).await;
        let outcome = match result {
            Ok(Ok(tls)) => {
                let (_, conn) = tls.get_ref();
                let info = TlsSessionInfo::from_state(conn, self.params.server_hostname.clone());
                Ok(HandshakeOutcome::Established(tls, info))
            }
            Ok(Err(e)) => self.classify(e),
            Err(_) => Err(self.timed_out()),
        };
        self.finish(outcome)
    }

    /// Wrap `connection` in TLS. `Ok(None)` means the peer disconnected.
    pub async fn secure(
        &mut self,
        context: &TlsContext,
        connection: Connection,
    ) -> Result<Option<Connection>, HandshakeFailure> {
        if self.state != HandshakeState::Init {
            return Err(self.already_finished());
        }
        let (meta, stream) = connection.into_parts();
        match context {
            TlsContext::Server(acceptor) => match self.accept(acceptor, stream).await? {
                HandshakeOutcome::Established(tls, info) => Ok(Some(Connection::from_parts(meta, tls, Some(info)))),
                HandshakeOutcome::Disconnected => Ok(None),
            },
            TlsContext::Client(connector) => match self.connect(connector, stream).await? {
                HandshakeOutcome::Established(tls, info) => Ok(Some(Connection::from_parts(meta, tls, Some(info)))),
                HandshakeOutcome::Disconnected => Ok(None),
            },
        }
    }

    /// Handshakes run once; a finished one is never driven again.
    fn begin(&mut self) -> Result<(), HandshakeFailure> {
        if self.state != HandshakeState::Init {
            return Err(self.already_finished());
        }
        self.state = HandshakeState::Handshaking;
        Ok(())
    }

    fn already_finished(&self) -> HandshakeFailure {
        self.failure(FailureKind::Other("handshake already finished".to_string()), None)
    }

    fn finish<T>(
        &mut self,
        outcome: Result<HandshakeOutcome<T>, HandshakeFailure>,
    ) -> Result<HandshakeOutcome<T>, HandshakeFailure> {
        let label = match &outcome {
            Ok(HandshakeOutcome::Established(_, info)) => {
                self.state = HandshakeState::Established;
                tracing::info!(
                    side = %self.params.side,
                    peer = ?self.peer,
                    version = %info.version,
                    cipher = %info.cipher,
                    "TLS handshake complete"
                );
                "established"
            }
            Ok(HandshakeOutcome::Disconnected) => {
                self.state = HandshakeState::Failed;
                tracing::debug!(side = %self.params.side, peer = ?self.peer, "Peer disconnected during TLS handshake");
                "disconnected"
            }
            Err(failure) => {
                self.state = HandshakeState::Failed;
                tracing::warn!(
                    side = %self.params.side,
                    peer = ?self.peer,
                    kind = failure.kind.as_str(),
                    verify_code = ?failure.verify_code,
                    server_hostname = ?failure.server_hostname,
                    error = %failure.message,
                    "TLS handshake failed"
                );
                failure.kind.as_str()
            }
        };
        metrics::record_handshake(self.params.side, label);
        outcome
    }

    fn classify<T>(&self, error: io::Error) -> Result<HandshakeOutcome<T>, HandshakeFailure> {
        let tls_error = error.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>());
        match tls_error {
            Some(tls_error) => Err(self.classify_tls(tls_error)),
            None if is_disconnect(&error) => Ok(HandshakeOutcome::Disconnected),
            None => Err(self.failure(FailureKind::Other(error.to_string()), None)),
        }
    }

    fn classify_tls(&self, error: &rustls::Error) -> HandshakeFailure {
        let kind = match error {
            rustls::Error::InvalidCertificate(cert_error) => match cert_error {
                CertificateError::Expired
                | CertificateError::ExpiredContext { .. }
                | CertificateError::NotValidYet
                | CertificateError::NotValidYetContext { .. }
                | CertificateError::Revoked => FailureKind::Expired,
                CertificateError::UnknownIssuer => FailureKind::WrongHost,
                CertificateError::Other(other) => match other.0.downcast_ref::<VerifyCodeError>() {
                    Some(coded) => FailureKind::from_code(coded.code)
                        .unwrap_or_else(|| FailureKind::Other(coded.reason.to_string())),
                    None => FailureKind::Other(error.to_string()),
                },
                _ if is_name_mismatch(error) => {
                    if matches!(self.params.server_name, Some(ServerName::IpAddress(_))) {
                        FailureKind::IpMismatch
                    } else {
                        FailureKind::HostnameMismatch
                    }
                }
                _ => FailureKind::Other(error.to_string()),
            },
            _ => FailureKind::Other(error.to_string()),
        };
        let code = kind.code();
        self.failure(kind, code).with_message(error.to_string())
    }

    fn timed_out(&self) -> HandshakeFailure {
        self.failure(
            FailureKind::Other(format!("handshake timed out after {:?}", self.timeout)),
            None,
        )
    }

    fn failure(&self, kind: FailureKind, verify_code: Option<i32>) -> HandshakeFailure {
        HandshakeFailure {
            message: kind.to_string(),
            kind,
            verify_code,
            peer: self.peer,
            server_hostname: match self.params.side {
                TlsSide::Client => self.params.server_hostname.clone(),
                TlsSide::Server => None,
            },
        }
    }
}

impl HandshakeFailure {
    fn with_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
