//! TLS policy: the attributes a TLS context is built from.
//!
//! A policy is a plain value. Relaxing it for one endpoint produces a new
//! value through the `with_*` methods; nothing mutates a policy in use.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::bind::is_true;
use crate::config::{expand_user, TlsConfig};
use crate::error::ConfigurationError;

/// Environment fallback for the private key passphrase.
pub const KEY_PASSWORD_ENV: &str = "DISPLAY_TRANSPORT_SSL_KEY_PASSWORD";

/// Which end of the handshake a context is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsSide {
    Server,
    Client,
}

impl fmt::Display for TlsSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TlsSide::Server => "server",
            TlsSide::Client => "client",
        })
    }
}

/// How strictly the peer certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    None,
    Optional,
    Required,
}

impl VerifyMode {
    const NAMES: [(&'static str, VerifyMode); 3] = [
        ("none", VerifyMode::None),
        ("optional", VerifyMode::Optional),
        ("required", VerifyMode::Required),
    ];

    pub fn parse(value: &str) -> Result<Self, ConfigurationError> {
        let token = value.trim();
        let token = strip_prefix_ignore_case(token, "CERT_");
        Self::NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, mode)| *mode)
            .ok_or_else(|| unknown("verify mode", value, Self::NAMES.iter().map(|(n, _)| *n)))
    }
}

/// Protocol selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Any supported version.
    Tls,
    TlsClient,
    TlsServer,
    TlsV1_2,
    TlsV1_3,
}

const PROTOCOLS: [(&str, Protocol); 5] = [
    ("TLS", Protocol::Tls),
    ("TLS_CLIENT", Protocol::TlsClient),
    ("TLS_SERVER", Protocol::TlsServer),
    ("TLSv1_2", Protocol::TlsV1_2),
    ("TLSv1_3", Protocol::TlsV1_3),
];

pub fn parse_protocol(value: &str) -> Result<Protocol, ConfigurationError> {
    let token = strip_prefix_ignore_case(value.trim(), "PROTOCOL_");
    PROTOCOLS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(token))
        .map(|(_, protocol)| *protocol)
        .ok_or_else(|| unknown("protocol", value, PROTOCOLS.iter().map(|(n, _)| *n)))
}

/// Certificate verification flags. Accepted for compatibility; chain
/// building is always strict.
pub const VERIFY_FLAGS: [&str; 7] = [
    "DEFAULT",
    "X509_STRICT",
    "X509_TRUSTED_FIRST",
    "X509_PARTIAL_CHAIN",
    "CRL_CHECK_LEAF",
    "CRL_CHECK_CHAIN",
    "ALLOW_PROXY_CERTS",
];

pub fn parse_verify_flags(value: &str) -> Result<Vec<&'static str>, ConfigurationError> {
    tokens(value)
        .map(|token| {
            let bare = strip_prefix_ignore_case(token, "VERIFY_");
            VERIFY_FLAGS
                .iter()
                .find(|flag| flag.eq_ignore_ascii_case(bare))
                .copied()
                .ok_or_else(|| unknown("verify flag", token, VERIFY_FLAGS))
        })
        .collect()
}

/// Context options that map onto rustls settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsOptions {
    pub no_tls12: bool,
    pub no_tls13: bool,
    pub no_ticket: bool,
    pub server_cipher_preference: bool,
}

pub const OPTIONS: [&str; 11] = [
    "ALL",
    "NO_COMPRESSION",
    "NO_SSLv2",
    "NO_SSLv3",
    "NO_TLSv1",
    "NO_TLSv1_1",
    "NO_TLSv1_2",
    "NO_TLSv1_3",
    "NO_TICKET",
    "CIPHER_SERVER_PREFERENCE",
    "NO_RENEGOTIATION",
];

pub fn parse_options(value: &str) -> Result<TlsOptions, ConfigurationError> {
    let mut options = TlsOptions::default();
    for token in tokens(value) {
        let bare = strip_prefix_ignore_case(token, "OP_");
        let name = OPTIONS
            .iter()
            .find(|option| option.eq_ignore_ascii_case(bare))
            .ok_or_else(|| unknown("option", token, OPTIONS))?;
        match *name {
            "NO_TLSv1_2" => options.no_tls12 = true,
            "NO_TLSv1_3" => options.no_tls13 = true,
            "NO_TICKET" => options.no_ticket = true,
            "CIPHER_SERVER_PREFERENCE" => options.server_cipher_preference = true,
            // SSLv2/3, TLS 1.0/1.1, compression and renegotiation are never offered
            _ => {}
        }
    }
    Ok(options)
}

/// Names of the cipher suites the crypto provider offers.
pub fn supported_cipher_suites() -> Vec<String> {
    rustls::crypto::ring::ALL_CIPHER_SUITES
        .iter()
        .map(|suite| format!("{:?}", suite.suite()))
        .collect()
}

/// `None` keeps the provider defaults.
pub fn parse_ciphers(value: &str) -> Result<Option<Vec<String>>, ConfigurationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("DEFAULT") || trimmed.eq_ignore_ascii_case("ALL") {
        return Ok(None);
    }
    let supported = supported_cipher_suites();
    trimmed
        .split([':', ','])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            supported
                .iter()
                .find(|name| name.eq_ignore_ascii_case(token))
                .cloned()
                .ok_or_else(|| unknown("cipher", token, supported.iter().map(String::as_str)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|token| !token.is_empty())
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> &'a str {
    match value.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &value[prefix.len()..],
        _ => value,
    }
}

fn unknown<'a>(what: &'static str, token: &str, valid: impl IntoIterator<Item = &'a str>) -> ConfigurationError {
    ConfigurationError::UnknownToken {
        what,
        token: token.to_string(),
        valid: valid.into_iter().collect::<Vec<_>>().join(", "),
    }
}

/// Everything needed to build one TLS context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    pub side: TlsSide,
    pub cert: String,
    pub key: String,
    pub key_password: Option<String>,
    pub ca_certs: String,
    pub ca_data: String,
    pub protocol: String,
    pub ciphers: String,
    /// Verification applied to the peer: client certificates on the server
    /// side, the server certificate on the client side.
    pub verify_mode: String,
    pub verify_flags: String,
    pub options: String,
    pub check_hostname: bool,
    pub server_hostname: String,
    pub cert_dirs: Vec<PathBuf>,
}

impl TlsPolicy {
    pub fn new(side: TlsSide) -> Self {
        Self::from_config(&TlsConfig::default(), side)
    }

    pub fn from_config(config: &TlsConfig, side: TlsSide) -> Self {
        let verify_mode = match side {
            TlsSide::Server => config.client_verify_mode.clone(),
            TlsSide::Client => config.server_verify_mode.clone(),
        };
        Self {
            side,
            cert: config.cert.clone(),
            key: config.key.clone(),
            key_password: config.key_password.clone(),
            ca_certs: config.ca_certs.clone(),
            ca_data: config.ca_data.clone(),
            protocol: config.protocol.clone(),
            ciphers: config.ciphers.clone(),
            verify_mode,
            verify_flags: config.verify_flags.clone(),
            options: config.options.clone(),
            check_hostname: config.check_hostname,
            server_hostname: config.server_hostname.clone(),
            cert_dirs: config.cert_dirs.iter().map(|dir| expand_user(dir)).collect(),
        }
    }

    pub fn with_server_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.server_hostname = hostname.into();
        self
    }

    pub fn with_check_hostname(mut self, check_hostname: bool) -> Self {
        self.check_hostname = check_hostname;
        self
    }

    pub fn with_ca_certs(mut self, ca_certs: impl Into<String>) -> Self {
        self.ca_certs = ca_certs.into();
        self
    }

    pub fn with_certificate(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.cert = cert.into();
        self.key = key.into();
        self
    }

    pub fn with_verify_mode(mut self, verify_mode: impl Into<String>) -> Self {
        self.verify_mode = verify_mode.into();
        self
    }

    /// Overlay remembered per-endpoint attributes.
    pub fn with_attributes(mut self, attributes: &BTreeMap<String, String>) -> Self {
        for (key, value) in attributes {
            match key.as_str() {
                "cert" => self.cert = value.clone(),
                "key" => self.key = value.clone(),
                "ca-certs" => self.ca_certs = value.clone(),
                "ca-data" => self.ca_data = value.clone(),
                "protocol" => self.protocol = value.clone(),
                "client-verify-mode" if self.side == TlsSide::Server => self.verify_mode = value.clone(),
                "server-verify-mode" if self.side == TlsSide::Client => self.verify_mode = value.clone(),
                "verify-flags" => self.verify_flags = value.clone(),
                "check-hostname" => self.check_hostname = is_true(value),
                "server-hostname" => self.server_hostname = value.clone(),
                "options" => self.options = value.clone(),
                "ciphers" => self.ciphers = value.clone(),
                _ => {}
            }
        }
        self
    }

    /// No explicit CA was configured; the platform trust store applies.
    pub fn uses_default_ca(&self) -> bool {
        self.ca_data.is_empty() && matches!(self.ca_certs.as_str(), "" | "default")
    }

    pub fn key_password(&self) -> Option<String> {
        self.key_password
            .clone()
            .or_else(|| std::env::var(KEY_PASSWORD_ENV).ok())
    }
}
