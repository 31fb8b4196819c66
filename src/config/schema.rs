//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport layer.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bind::TransportKind;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Bind specs per transport kind.
    pub bind: BindConfig,

    /// Inet listener creation.
    pub listener: ListenerConfig,

    /// Local (unix domain) sockets.
    pub local: LocalSocketConfig,

    /// Socket path probing.
    pub probe: ProbeConfig,

    /// TLS policy attributes.
    pub tls: TlsConfig,

    /// Remembered certificate exceptions.
    pub trust: TrustConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// mDNS publication.
    pub mdns: MdnsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Bind specs, one list per transport kind.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BindConfig {
    pub tcp: Vec<String>,
    pub ssl: Vec<String>,
    pub ssh: Vec<String>,
    pub ws: Vec<String>,
    pub wss: Vec<String>,
    pub rfb: Vec<String>,
    pub quic: Vec<String>,
    pub vsock: Vec<String>,
    /// Local socket paths, `auto`, `@abstract` names or directories.
    pub socket: Vec<String>,
    pub named_pipe: Vec<String>,
}

impl BindConfig {
    pub fn specs(&self, kind: TransportKind) -> &[String] {
        match kind {
            TransportKind::Tcp => &self.tcp,
            TransportKind::Ssl => &self.ssl,
            TransportKind::Ssh => &self.ssh,
            TransportKind::Ws => &self.ws,
            TransportKind::Wss => &self.wss,
            TransportKind::Rfb => &self.rfb,
            TransportKind::Quic => &self.quic,
            TransportKind::Vsock => &self.vsock,
            TransportKind::Socket => &self.socket,
            TransportKind::NamedPipe => &self.named_pipe,
        }
    }

    pub fn specs_mut(&mut self, kind: TransportKind) -> &mut Vec<String> {
        match kind {
            TransportKind::Tcp => &mut self.tcp,
            TransportKind::Ssl => &mut self.ssl,
            TransportKind::Ssh => &mut self.ssh,
            TransportKind::Ws => &mut self.ws,
            TransportKind::Wss => &mut self.wss,
            TransportKind::Rfb => &mut self.rfb,
            TransportKind::Quic => &mut self.quic,
            TransportKind::Vsock => &mut self.vsock,
            TransportKind::Socket => &mut self.socket,
            TransportKind::NamedPipe => &mut self.named_pipe,
        }
    }
}

/// Inet listener creation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Lowest non-zero port a spec may request.
    pub min_port: u16,

    /// Extra passes over endpoints whose address is still in use.
    pub retry_attempts: u32,

    /// Pause between passes in milliseconds.
    pub retry_pause_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            min_port: 1024,
            retry_attempts: 2,
            retry_pause_ms: 1000,
        }
    }
}

impl ListenerConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }
}

/// Local socket placement and permissions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalSocketConfig {
    /// Directory for relative socket names. Empty means
    /// `$XDG_RUNTIME_DIR/display-transport`, falling back to `/tmp`.
    pub socket_dir: String,

    /// Name used for `auto` sockets and directory specs.
    pub display_name: Option<String>,

    /// Unlink existing paths without probing them.
    pub clobber: bool,

    /// Octal mode for created sockets.
    pub socket_permissions: String,

    /// Sockets shared with the shared-memory group get mode 0660.
    pub mmap_group: bool,

    /// Group given ownership of shared sockets and directories.
    pub trust_group: String,

    /// System-wide socket directories.
    pub shared_dirs: Vec<String>,

    /// Mode for shared directories.
    pub shared_dir_mode: u32,

    /// Also create an abstract socket for `auto` (Linux only).
    pub abstract_sockets: bool,
}

impl Default for LocalSocketConfig {
    fn default() -> Self {
        Self {
            socket_dir: String::new(),
            display_name: None,
            clobber: false,
            socket_permissions: "600".to_string(),
            mmap_group: false,
            trust_group: "display-transport".to_string(),
            shared_dirs: vec![
                "/run/display-transport".to_string(),
                "/var/run/display-transport".to_string(),
            ],
            shared_dir_mode: 0o775,
            abstract_sockets: cfg!(target_os = "linux"),
        }
    }
}

/// Socket path probing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Bound of a single connect attempt.
    pub short_timeout_ms: u64,

    /// How long an undecided path keeps being re-probed.
    pub long_timeout_ms: u64,

    /// Pause between re-probes.
    pub interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            short_timeout_ms: 100,
            long_timeout_ms: 6000,
            interval_ms: 1000,
        }
    }
}

impl ProbeConfig {
    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// TLS policy attributes. Token lists are comma separated.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate file, `auto`, or empty to search `cert_dirs`.
    pub cert: String,

    /// Key file; empty means the key lives in the certificate file.
    pub key: String,

    pub key_password: Option<String>,

    /// `default`, `auto`, a PEM file or a directory of PEM files.
    pub ca_certs: String,

    /// Inline CA certificates (hex, `b64:` or PEM).
    pub ca_data: String,

    pub protocol: String,

    pub client_verify_mode: String,

    pub server_verify_mode: String,

    pub verify_flags: String,

    pub check_hostname: bool,

    pub server_hostname: String,

    pub options: String,

    pub ciphers: String,

    /// Search path for `ssl-cert.pem` and `ca-cert.pem`.
    pub cert_dirs: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: String::new(),
            key: String::new(),
            key_password: None,
            ca_certs: "default".to_string(),
            ca_data: String::new(),
            protocol: "TLS".to_string(),
            client_verify_mode: "optional".to_string(),
            server_verify_mode: "required".to_string(),
            verify_flags: "X509_STRICT".to_string(),
            check_hostname: true,
            server_hostname: String::new(),
            options: "ALL,NO_COMPRESSION".to_string(),
            ciphers: "DEFAULT".to_string(),
            cert_dirs: default_cert_dirs(),
        }
    }
}

fn default_cert_dirs() -> Vec<String> {
    [
        "~/.config/display-transport/ssl",
        "~/.display-transport/ssl",
        "/etc/display-transport/ssl",
        "/usr/local/etc/display-transport/ssl",
        "/etc/display-transport",
        "/usr/local/etc/display-transport",
        "./",
    ]
    .iter()
    .map(|dir| dir.to_string())
    .collect()
}

/// Remembered certificate exceptions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Offer to accept fixable certificate failures and retry once.
    pub retry: bool,

    /// Directories holding one sub-directory per remembered endpoint.
    /// The first entry is where new decisions are written.
    pub hosts_dirs: Vec<String>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            retry: true,
            hosts_dirs: vec!["~/.config/display-transport/ssl/hosts".to_string()],
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connect timeout. TLS handshakes on both sides share it.
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

/// mDNS publication of the created listeners.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MdnsConfig {
    pub enabled: bool,

    /// Advertised service name; the host name when empty.
    pub service_name: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: TransportConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.min_port, 1024);
        assert_eq!(config.local.socket_permissions, "600");
        assert_eq!(config.tls.ca_certs, "default");
        assert!(config.trust.retry);
        assert_eq!(config.probe.long_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn test_bind_lists_parse() {
        let config: TransportConfig = toml::from_str(
            r#"
            [bind]
            tcp = ["0.0.0.0:10000,upnp=no"]
            socket = ["auto"]

            [local]
            shared_dir_mode = 0o750
            "#,
        )
        .unwrap();
        assert_eq!(config.bind.specs(TransportKind::Tcp), ["0.0.0.0:10000,upnp=no"]);
        assert_eq!(config.bind.specs(TransportKind::Socket), ["auto"]);
        assert_eq!(config.local.shared_dir_mode, 0o750);
    }
}
