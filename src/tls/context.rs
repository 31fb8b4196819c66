//! TLS context construction.
//!
//! `build_context` turns a `TlsPolicy` into a ready acceptor or connector
//! plus the per-connection handshake parameters. It performs no I/O beyond
//! reading the certificate files the policy names.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ConfigurationError;
use crate::tls::certs::{self, CA_CERT_FILE, SERVER_CERT_FILE};
use crate::tls::policy::{self, Protocol, TlsOptions, TlsPolicy, TlsSide, VerifyMode};
use crate::tls::verifier::{AcceptAnyServerCert, PolicyServerVerifier};

/// A built acceptor or connector.
#[derive(Clone)]
pub enum TlsContext {
    Server(TlsAcceptor),
    Client(TlsConnector),
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsContext::Server(_) => f.write_str("TlsContext::Server"),
            TlsContext::Client(_) => f.write_str("TlsContext::Client"),
        }
    }
}

/// Per-connection handshake parameters.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub side: TlsSide,
    /// Name sent in SNI and checked against the certificate.
    pub server_name: Option<ServerName<'static>>,
    pub server_hostname: Option<String>,
}

impl HandshakeParams {
    /// Use `fallback` when the policy carries no server hostname.
    pub fn with_fallback_name(mut self, fallback: &str) -> Result<Self, ConfigurationError> {
        if self.server_name.is_none() {
            self.server_name = Some(server_name(fallback)?);
            self.server_hostname = Some(fallback.to_string());
        }
        Ok(self)
    }

    pub fn server_name_is_ip(&self) -> bool {
        matches!(self.server_name, Some(ServerName::IpAddress(_)))
    }
}

pub(crate) fn server_name(hostname: &str) -> Result<ServerName<'static>, ConfigurationError> {
    let bare = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }
    ServerName::try_from(bare.to_string()).map_err(|_| ConfigurationError::InvalidServerHostname(hostname.to_string()))
}

/// Provider restricted to the policy's cipher suites.
pub fn crypto_provider(ciphers: &str) -> Result<CryptoProvider, ConfigurationError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(selected) = policy::parse_ciphers(ciphers)? {
        provider
            .cipher_suites
            .retain(|suite| selected.contains(&format!("{:?}", suite.suite())));
    }
    Ok(provider)
}

fn protocol_versions(
    protocol: Protocol,
    options: TlsOptions,
    side: TlsSide,
) -> Result<Vec<&'static SupportedProtocolVersion>, ConfigurationError> {
    match (protocol, side) {
        (Protocol::TlsClient, TlsSide::Server) | (Protocol::TlsServer, TlsSide::Client) => {
            return Err(ConfigurationError::Tls(format!(
                "protocol {:?} cannot be used on the {} side",
                protocol, side
            )))
        }
        _ => {}
    }
    let mut versions = Vec::with_capacity(2);
    if !options.no_tls13 && protocol != Protocol::TlsV1_2 {
        versions.push(&rustls::version::TLS13);
    }
    if !options.no_tls12 && protocol != Protocol::TlsV1_3 {
        versions.push(&rustls::version::TLS12);
    }
    if versions.is_empty() {
        return Err(ConfigurationError::Tls("no TLS protocol version left enabled".to_string()));
    }
    Ok(versions)
}

/// CA roots: inline data, then a file or directory, then the bundled roots.
fn resolve_roots(policy: &TlsPolicy) -> Result<RootCertStore, ConfigurationError> {
    if !policy.ca_data.is_empty() {
        return certs::roots_from(certs::decode_ca_data(&policy.ca_data)?);
    }
    match policy.ca_certs.as_str() {
        "" | "default" => Ok(certs::default_roots()),
        "auto" => match certs::find_in_dirs(&policy.cert_dirs, CA_CERT_FILE) {
            Some(path) => certs::roots_from(certs::load_ca_path(&path)?),
            None => Ok(certs::default_roots()),
        },
        path => certs::roots_from(certs::load_ca_path(Path::new(path))?),
    }
}

fn resolve_server_cert(policy: &TlsPolicy) -> Result<PathBuf, ConfigurationError> {
    match policy.cert.as_str() {
        "" => certs::find_in_dirs(&policy.cert_dirs, SERVER_CERT_FILE).ok_or(ConfigurationError::MissingCertificate),
        "auto" => {
            certs::find_in_dirs(&policy.cert_dirs, SERVER_CERT_FILE).ok_or(ConfigurationError::CertificateNotFound)
        }
        path => Ok(PathBuf::from(path)),
    }
}

fn load_identity(
    cert_path: &Path,
    key: &str,
    policy: &TlsPolicy,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ConfigurationError> {
    let chain = certs::load_certs(cert_path)?;
    let key_path = if key.is_empty() { cert_path.to_path_buf() } else { PathBuf::from(key) };
    let key = certs::load_private_key(&key_path).map_err(|e| match (e, policy.key_password().is_some()) {
        (ConfigurationError::EncryptedKey { path }, true) => {
            tracing::warn!(path = %path, "A key passphrase is configured but only unencrypted keys can be loaded");
            ConfigurationError::EncryptedKey { path }
        }
        (e, _) => e,
    })?;
    Ok((chain, key))
}

/// Build an acceptor (server side) or connector (client side) for `policy`.
pub fn build_context(policy: &TlsPolicy) -> Result<(TlsContext, HandshakeParams), ConfigurationError> {
    let protocol = policy::parse_protocol(&policy.protocol)?;
    let options = policy::parse_options(&policy.options)?;
    let verify_mode = VerifyMode::parse(&policy.verify_mode)?;
    let flags = policy::parse_verify_flags(&policy.verify_flags)?;
    let versions = protocol_versions(protocol, options, policy.side)?;
    let provider = Arc::new(crypto_provider(&policy.ciphers)?);

    tracing::debug!(
        side = %policy.side,
        protocol = ?protocol,
        verify_mode = ?verify_mode,
        verify_flags = ?flags,
        check_hostname = policy.check_hostname,
        "Building TLS context"
    );

    match policy.side {
        TlsSide::Server => build_server(policy, verify_mode, options, &versions, provider),
        TlsSide::Client => build_client(policy, verify_mode, options, &versions, provider),
    }
}

fn build_server(
    policy: &TlsPolicy,
    verify_mode: VerifyMode,
    options: TlsOptions,
    versions: &[&'static SupportedProtocolVersion],
    provider: Arc<CryptoProvider>,
) -> Result<(TlsContext, HandshakeParams), ConfigurationError> {
    let cert_path = resolve_server_cert(policy)?;
    let (chain, key) = load_identity(&cert_path, &policy.key, policy)?;

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?;

    let builder = match verify_mode {
        VerifyMode::None => builder.with_no_client_auth(),
        mode => {
            let roots = Arc::new(resolve_roots(policy)?);
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider));
            let verifier = if mode == VerifyMode::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier.build().map_err(|e| ConfigurationError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder
        .with_single_cert(chain, key)
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?;
    config.ignore_client_order = options.server_cipher_preference;
    if options.no_ticket {
        config.send_tls13_tickets = 0;
    }

    tracing::info!(cert = %cert_path.display(), "Server TLS context ready");
    Ok((
        TlsContext::Server(TlsAcceptor::from(Arc::new(config))),
        HandshakeParams {
            side: TlsSide::Server,
            server_name: None,
            server_hostname: None,
        },
    ))
}

fn build_client(
    policy: &TlsPolicy,
    verify_mode: VerifyMode,
    options: TlsOptions,
    versions: &[&'static SupportedProtocolVersion],
    provider: Arc<CryptoProvider>,
) -> Result<(TlsContext, HandshakeParams), ConfigurationError> {
    if policy.check_hostname && policy.server_hostname.is_empty() {
        return Err(ConfigurationError::HostnameCheckWithoutHostname);
    }

    let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> = match verify_mode {
        VerifyMode::None => Arc::new(AcceptAnyServerCert::new(Arc::clone(&provider))),
        VerifyMode::Optional | VerifyMode::Required => Arc::new(
            PolicyServerVerifier::new(resolve_roots(policy)?, Arc::clone(&provider), policy.check_hostname)
                .map_err(|e| ConfigurationError::Tls(e.to_string()))?,
        ),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)
        .map_err(|e| ConfigurationError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let mut config = if policy.cert.is_empty() || policy.cert == "auto" {
        builder.with_no_client_auth()
    } else {
        let cert_path = PathBuf::from(&policy.cert);
        let (chain, key) = load_identity(&cert_path, &policy.key, policy)?;
        builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| ConfigurationError::Tls(e.to_string()))?
    };
    if options.no_ticket {
        config.resumption = Resumption::disabled();
    }

    let (server_name, server_hostname) = if policy.server_hostname.is_empty() {
        (None, None)
    } else {
        (
            Some(server_name(&policy.server_hostname)?),
            Some(policy.server_hostname.clone()),
        )
    };

    Ok((
        TlsContext::Client(TlsConnector::from(Arc::new(config))),
        HandshakeParams {
            side: TlsSide::Client,
            server_name,
            server_hostname,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_identity(dir: &Path) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        fs::write(&cert, certified.cert.pem()).unwrap();
        fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
        (cert, key)
    }

    fn server_policy(dirs: Vec<PathBuf>) -> TlsPolicy {
        let mut policy = TlsPolicy::new(TlsSide::Server);
        policy.cert_dirs = dirs;
        policy
    }

    #[test]
    fn test_client_requires_hostname_when_checking() {
        let policy = TlsPolicy::new(TlsSide::Client);
        assert_eq!(
            build_context(&policy).unwrap_err(),
            ConfigurationError::HostnameCheckWithoutHostname
        );
        let policy = policy.with_check_hostname(false);
        let (ctx, params) = build_context(&policy).unwrap();
        assert!(matches!(ctx, TlsContext::Client(_)));
        assert!(params.server_name.is_none());
    }

    #[test]
    fn test_server_without_certificate() {
        let empty = tempfile::tempdir().unwrap();
        let policy = server_policy(vec![empty.path().to_path_buf()]);
        assert_eq!(build_context(&policy).unwrap_err(), ConfigurationError::MissingCertificate);
        let policy = policy.with_certificate("auto", "");
        assert_eq!(build_context(&policy).unwrap_err(), ConfigurationError::CertificateNotFound);
    }

    #[test]
    fn test_server_finds_combined_pem_in_cert_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_identity(dir.path());
        let combined = format!("{}{}", fs::read_to_string(&key).unwrap(), fs::read_to_string(&cert).unwrap());
        fs::write(dir.path().join(SERVER_CERT_FILE), combined).unwrap();

        let policy = server_policy(vec![dir.path().to_path_buf()]).with_verify_mode("none");
        let (ctx, params) = build_context(&policy).unwrap();
        assert!(matches!(ctx, TlsContext::Server(_)));
        assert_eq!(params.side, TlsSide::Server);
    }

    #[test]
    fn test_server_with_client_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_identity(dir.path());
        let policy = server_policy(vec![])
            .with_certificate(cert.to_string_lossy(), key.to_string_lossy())
            .with_ca_certs(cert.to_string_lossy())
            .with_verify_mode("required");
        assert!(build_context(&policy).is_ok());
    }

    #[test]
    fn test_unknown_tokens_fail_build() {
        let mut policy = TlsPolicy::new(TlsSide::Client).with_server_hostname("localhost");
        policy.options = "ALL,NO_FUN".to_string();
        assert!(matches!(
            build_context(&policy),
            Err(ConfigurationError::UnknownToken { what: "option", .. })
        ));
    }

    #[test]
    fn test_protocol_versions() {
        let options = TlsOptions::default();
        assert_eq!(protocol_versions(Protocol::Tls, options, TlsSide::Client).unwrap().len(), 2);
        assert_eq!(protocol_versions(Protocol::TlsV1_3, options, TlsSide::Client).unwrap().len(), 1);
        assert!(protocol_versions(Protocol::TlsClient, options, TlsSide::Server).is_err());
        let no_versions = TlsOptions {
            no_tls12: true,
            no_tls13: true,
            ..TlsOptions::default()
        };
        assert!(protocol_versions(Protocol::Tls, no_versions, TlsSide::Client).is_err());
    }

    #[test]
    fn test_missing_ca_path() {
        let policy = TlsPolicy::new(TlsSide::Client)
            .with_server_hostname("localhost")
            .with_ca_certs("/nonexistent/ca.pem");
        assert!(matches!(build_context(&policy), Err(ConfigurationError::MissingCaCerts(_))));
    }

    #[test]
    fn test_server_names() {
        assert!(matches!(server_name("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name("[::1]").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name("example.org").unwrap(), ServerName::DnsName(_)));
    }
}
