//! Connect with TLS, offering to trust the peer once on a fixable failure.
//!
//! # Data Flow
//! ```text
//! connect(host, port)
//!     → base policy + stored TrustException → attempt
//!     → fixable HandshakeFailure? ──no──▶ error
//!         │ yes (retry enabled, Confirm available)
//!         ▼
//!     SelfSigned: reuse stored cert.pem, or fetch + confirm + save
//!     Name / WrongHost: confirm + save check-hostname=false
//!         ▼
//!     rebuilt policy → attempt once more (second failure is final)
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::bind::{is_true, TransportKind};
use crate::config::TransportConfig;
use crate::error::ConnectError;
use crate::net::{Connection, Endpoint};
use crate::observability::metrics;
use crate::tls::certs::pem_encode_certificate;
use crate::tls::handshake::{FailureKind, Handshake, HandshakeFailure};
use crate::tls::{build_context, context, AcceptAnyServerCert, TlsPolicy, TlsSide};
use crate::trust::prompt::Confirm;
use crate::trust::store::{TrustDecisionStore, TrustException, CERT_FILE};

pub const CONFIRM_TITLE: &str = "SSL Certificate Verification Failure";
pub const ACCEPT_CERT_PROMPT: &str = "Do you want to accept this certificate?";
pub const CONNECT_ANYWAY_PROMPT: &str = "Do you want to connect anyway?";

/// TLS client connector backed by a trust decision store.
#[derive(Clone)]
pub struct TrustedConnector {
    policy: TlsPolicy,
    store: TrustDecisionStore,
    confirm: Option<Arc<dyn Confirm>>,
    retry: bool,
    connect_timeout: Duration,
}

impl TrustedConnector {
    pub fn new(policy: TlsPolicy, store: TrustDecisionStore) -> Self {
        Self {
            policy,
            store,
            confirm: None,
            retry: true,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            TlsPolicy::from_config(&config.tls, TlsSide::Client),
            TrustDecisionStore::from_config(&config.trust),
        )
        .with_retry(config.trust.retry)
        .with_connect_timeout(config.timeouts.connect())
    }

    pub fn with_confirm(mut self, confirm: impl Confirm + 'static) -> Self {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Bounds both the TCP connect and the TLS handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn store(&self) -> &TrustDecisionStore {
        &self.store
    }

    /// The effective policy for an endpoint: the base policy, the host as
    /// server hostname unless one is configured, then stored overrides.
    pub fn policy_for(&self, host: &str, port: u16) -> (TlsPolicy, TrustException) {
        let policy = self.base_policy(host);
        let exception = self.store.load(&policy.server_hostname, port);
        (policy.with_attributes(&exception.attributes), exception)
    }

    fn base_policy(&self, host: &str) -> TlsPolicy {
        let mut policy = self.policy.clone();
        if policy.server_hostname.is_empty() {
            policy.server_hostname = bare_host(host).to_string();
        }
        policy
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection, ConnectError> {
        let (policy, mut exception) = self.policy_for(host, port);
        let failure = match self.attempt(&policy, host, port).await {
            Err(ConnectError::Handshake(failure)) => failure,
            other => return other,
        };
        if !failure.is_fixable() || !self.retry {
            return Err(failure.into());
        }
        let Some(confirm) = self.confirm.clone() else {
            tracing::debug!(kind = failure.kind.as_str(), "No way to confirm a trust decision");
            return Err(failure.into());
        };

        if !self.resolve_failure(&policy, &failure, &mut exception, host, port, confirm).await? {
            return Err(failure.into());
        }

        let retry_policy = self.base_policy(host).with_attributes(&exception.attributes);
        tracing::info!(host, port, kind = failure.kind.as_str(), "Retrying TLS connection with updated trust");
        self.attempt(&retry_policy, host, port).await
    }

    async fn attempt(&self, policy: &TlsPolicy, host: &str, port: u16) -> Result<Connection, ConnectError> {
        let (context, params) = build_context(policy)?;
        let params = params.with_fallback_name(bare_host(host))?;
        let endpoint = endpoint_name(host, port);

        let stream = self.tcp_connect(host, port, &endpoint).await?;
        let peer = stream.peer_addr().ok();
        let local = stream
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or(Endpoint::Unknown);
        let connection = Connection::new(
            TransportKind::Ssl,
            local,
            peer.map(Endpoint::from).unwrap_or(Endpoint::Unknown),
            stream,
        );

        let mut handshake = Handshake::new(params, peer, self.connect_timeout);
        match handshake.secure(&context, connection).await? {
            Some(connection) => Ok(connection),
            None => Err(ConnectError::Disconnected { endpoint }),
        }
    }

    async fn tcp_connect(&self, host: &str, port: u16, endpoint: &str) -> Result<TcpStream, ConnectError> {
        let connect = TcpStream::connect((bare_host(host), port));
        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Connect {
                endpoint: endpoint.to_string(),
                source,
            }),
            Err(_) => Err(ConnectError::Connect {
                endpoint: endpoint.to_string(),
                source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
            }),
        }
    }

    /// Ask about a fixable failure and record the answer. Returns whether a
    /// retry should be made.
    async fn resolve_failure(
        &self,
        policy: &TlsPolicy,
        failure: &HandshakeFailure,
        exception: &mut TrustException,
        host: &str,
        port: u16,
        confirm: Arc<dyn Confirm>,
    ) -> Result<bool, ConnectError> {
        let hostname = policy.server_hostname.clone();
        let endpoint = endpoint_name(host, port);
        let store_error = |source: io::Error| ConnectError::TrustStore {
            endpoint: endpoint.clone(),
            source,
        };

        match failure.kind {
            FailureKind::SelfSigned => {
                if !policy.uses_default_ca() {
                    tracing::debug!(ca_certs = %policy.ca_certs, "Self-signed certificate does not match the configured CA");
                    return Ok(false);
                }
                if let Some(cert) = self.store.find_file(&hostname, port, CERT_FILE) {
                    tracing::info!(path = %cert.display(), "Retrying with the stored certificate");
                    exception.set("ca-certs", cert.to_string_lossy());
                    return Ok(true);
                }
                let der = match fetch_peer_certificate(host, port, &hostname, self.connect_timeout).await {
                    Ok(der) => der,
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "Failed to get the server certificate");
                        return Ok(false);
                    }
                };
                if !ask(confirm, failure, ACCEPT_CERT_PROMPT).await {
                    return Ok(false);
                }
                let pem = pem_encode_certificate(der.as_ref());
                let cert = self
                    .store
                    .save_file(&hostname, port, CERT_FILE, pem.as_bytes())
                    .map_err(store_error)?;
                exception.set("ca-certs", cert.to_string_lossy());
                self.store.save(exception).map_err(store_error)?;
                Ok(true)
            }
            FailureKind::WrongHost | FailureKind::IpMismatch | FailureKind::HostnameMismatch => {
                if hostname_check_relaxed(exception) {
                    tracing::debug!(endpoint = %endpoint, "Hostname checks are already off for this endpoint");
                    return Ok(false);
                }
                if !ask(confirm, failure, CONNECT_ANYWAY_PROMPT).await {
                    return Ok(false);
                }
                tracing::info!(endpoint = %endpoint, "User chose to connect anyway, retrying without checking the hostname");
                exception.set("check-hostname", "false");
                self.store.save(exception).map_err(store_error)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl std::fmt::Debug for TrustedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedConnector")
            .field("policy", &self.policy)
            .field("store", &self.store)
            .field("confirm", &self.confirm.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}

async fn ask(confirm: Arc<dyn Confirm>, failure: &HandshakeFailure, prompt: &'static str) -> bool {
    let message = failure.to_string();
    let kind = failure.kind.as_str().to_string();
    let accepted = tokio::task::spawn_blocking(move || confirm.confirm(&message, CONFIRM_TITLE, prompt))
        .await
        .unwrap_or(false);
    tracing::info!(kind = %kind, accepted, "Trust prompt answered");
    metrics::record_trust_prompt(&kind, accepted);
    accepted
}

/// Retrieve the peer's leaf certificate over an unverified connection.
pub async fn fetch_peer_certificate(
    host: &str,
    port: u16,
    server_hostname: &str,
    timeout: Duration,
) -> io::Result<CertificateDer<'static>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(provider)))
        .with_no_client_auth();
    let name = context::server_name(server_hostname).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let fetch = async {
        let stream = TcpStream::connect((bare_host(host), port)).await?;
        let tls = TlsConnector::from(Arc::new(config)).connect(name, stream).await?;
        let (_, conn) = tls.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "server sent no certificate"))
    };
    tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "timed out fetching the certificate"))?
}

fn hostname_check_relaxed(exception: &TrustException) -> bool {
    exception
        .attributes
        .get("check-hostname")
        .is_some_and(|value| !is_true(value))
}

fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn endpoint_name(host: &str, port: u16) -> String {
    let host = bare_host(host);
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_names() {
        assert_eq!(endpoint_name("localhost", 443), "localhost:443");
        assert_eq!(endpoint_name("::1", 443), "[::1]:443");
        assert_eq!(endpoint_name("[::1]", 443), "[::1]:443");
        assert_eq!(bare_host("[fe80::1]"), "fe80::1");
    }

    #[test]
    fn test_policy_for_uses_host_and_stored_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustDecisionStore::new(vec![dir.path().to_path_buf()]);
        let mut exception = TrustException::new("example.org", 8443);
        exception.set("check-hostname", "false");
        store.save(&exception).unwrap();

        let connector = TrustedConnector::new(TlsPolicy::new(TlsSide::Client), store);
        let (policy, loaded) = connector.policy_for("example.org", 8443);
        assert_eq!(policy.server_hostname, "example.org");
        assert!(!policy.check_hostname);
        assert_eq!(loaded, exception);

        let (policy, loaded) = connector.policy_for("example.org", 443);
        assert!(policy.check_hostname);
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_relaxed_hostname_check_detection() {
        let mut exception = TrustException::new("example.org", 443);
        assert!(!hostname_check_relaxed(&exception));
        exception.set("check-hostname", "false");
        assert!(hostname_check_relaxed(&exception));
        exception.set("check-hostname", "yes");
        assert!(!hostname_check_relaxed(&exception));
    }

    #[test]
    fn test_handshake_shares_connect_timeout() {
        let mut config = TransportConfig::default();
        config.timeouts.connect_secs = 3;
        let connector = TrustedConnector::from_config(&config);
        assert_eq!(connector.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_configured_hostname_wins() {
        let dir = tempfile::tempdir().unwrap();
        let policy = TlsPolicy::new(TlsSide::Client).with_server_hostname("real.example.org");
        let connector = TrustedConnector::new(policy, TrustDecisionStore::new(vec![dir.path().to_path_buf()]));
        let (policy, _) = connector.policy_for("10.0.0.1", 443);
        assert_eq!(policy.server_hostname, "real.example.org");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let connector = TrustedConnector::new(
            TlsPolicy::new(TlsSide::Client),
            TrustDecisionStore::new(vec![dir.path().to_path_buf()]),
        );
        let err = connector.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ConnectError::Connect { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{}", port)));
    }
}
