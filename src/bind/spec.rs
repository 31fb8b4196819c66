//! Bind-spec grammar.
//!
//! ```text
//! inet:   [HOST]:[PORT][,key=value,...]
//! vsock:  CID:PORT[,key=value,...]
//! path:   PATH[,key=value,...]
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::bind::TransportKind;
use crate::context::RuntimeContext;
use crate::error::ConfigurationError;

/// Options attached to a bind spec, kept opaque except for the few keys
/// the factory itself understands.
pub type BindOptions = BTreeMap<String, String>;

/// Host used when a spec leaves the host empty.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Wildcard context id: listen for any guest.
pub const CID_ANY: u32 = u32::MAX;

const CID_NAMES: [(&str, u32); 5] = [
    ("any", CID_ANY),
    ("auto", CID_ANY),
    ("hypervisor", 0),
    ("local", 1),
    ("host", 2),
];

const TRUE_VALUES: [&str; 5] = ["1", "true", "yes", "on", "enabled"];

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum BindAddress {
    Inet { host: String, port: u16 },
    Vsock { cid: u32, port: u32 },
    Path { path: String },
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddress::Inet { host, port } => {
                if host.contains(':') {
                    write!(f, "[{}]:{}", host, port)
                } else {
                    write!(f, "{}:{}", host, port)
                }
            }
            BindAddress::Vsock { cid, port } => write!(f, "{}:{}", cid, port),
            BindAddress::Path { path } => f.write_str(path),
        }
    }
}

/// One parsed bind spec, before wildcard expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindSpec {
    pub kind: TransportKind,
    pub address: BindAddress,
    pub options: BindOptions,
}

impl BindSpec {
    /// Expand into concrete listener requests. `*` becomes the wildcard
    /// address(es) this host can serve.
    pub fn to_requests(&self, ctx: &RuntimeContext) -> Vec<ListenerRequest> {
        match &self.address {
            BindAddress::Inet { host, port } if host == "*" => wildcard_hosts(ctx)
                .into_iter()
                .map(|wildcard| ListenerRequest {
                    kind: self.kind,
                    address: BindAddress::Inet {
                        host: wildcard.to_string(),
                        port: *port,
                    },
                    options: self.options.clone(),
                })
                .collect(),
            address => vec![ListenerRequest {
                kind: self.kind,
                address: address.clone(),
                options: self.options.clone(),
            }],
        }
    }

    /// Reject non-zero ports below `min_port`.
    pub fn check_min_port(&self, min_port: u16) -> Result<(), ConfigurationError> {
        if let BindAddress::Inet { port, .. } = &self.address {
            if *port != 0 && *port < min_port {
                return Err(ConfigurationError::PortBelowMinimum {
                    spec: self.to_string(),
                    port: *port,
                    min_port,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)?;
        for (key, value) in &self.options {
            write!(f, ",{}={}", key, value)?;
        }
        Ok(())
    }
}

/// A single endpoint to bind. Consumed by the listener factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerRequest {
    pub kind: TransportKind,
    pub address: BindAddress,
    pub options: BindOptions,
}

impl ListenerRequest {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn option_enabled(&self, key: &str) -> bool {
        self.option(key).map(is_true).unwrap_or(false)
    }
}

impl fmt::Display for ListenerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.address)
    }
}

/// Hosts that `*` stands for.
pub fn wildcard_hosts(ctx: &RuntimeContext) -> Vec<&'static str> {
    if ctx.dualstack_ipv6 {
        vec!["::"]
    } else if !ctx.ipv6 {
        vec!["0.0.0.0"]
    } else {
        vec!["0.0.0.0", "::"]
    }
}

/// Truthy option values.
pub fn is_true(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    TRUE_VALUES.contains(&lower.as_str())
}

/// Parse every spec of one kind. Later duplicates of the same address
/// replace the options of the earlier one but keep its position.
pub fn parse_bind_specs<S: AsRef<str>>(kind: TransportKind, specs: &[S]) -> Result<Vec<BindSpec>, ConfigurationError> {
    let mut parsed: Vec<BindSpec> = Vec::with_capacity(specs.len());
    for spec in specs {
        let spec = parse_bind_spec(kind, spec.as_ref())?;
        match parsed.iter_mut().find(|existing| existing.address == spec.address) {
            Some(existing) => {
                tracing::debug!(kind = %kind, address = %spec.address, "Duplicate bind spec replaced");
                existing.options = spec.options;
            }
            None => parsed.push(spec),
        }
    }
    Ok(parsed)
}

/// Parse one spec according to the addressing family of `kind`.
pub fn parse_bind_spec(kind: TransportKind, spec: &str) -> Result<BindSpec, ConfigurationError> {
    let (address_part, options_part) = match spec.split_once(',') {
        Some((address, options)) => (address, Some(options)),
        None => (spec, None),
    };
    let options = match options_part {
        Some(options) => parse_options(spec, options)?,
        None => BindOptions::new(),
    };

    let address = match kind {
        TransportKind::Vsock => parse_vsock_address(spec, address_part)?,
        TransportKind::Socket | TransportKind::NamedPipe => parse_path_address(address_part)?,
        _ => parse_inet_address(kind, spec, address_part)?,
    };

    Ok(BindSpec {
        kind,
        address,
        options,
    })
}

/// `key=value,key=value`
pub fn parse_options(spec: &str, options: &str) -> Result<BindOptions, ConfigurationError> {
    let mut parsed = BindOptions::new();
    for entry in options.split(',').filter(|entry| !entry.is_empty()) {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                parsed.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(ConfigurationError::InvalidOption {
                    spec: spec.to_string(),
                    entry: entry.to_string(),
                })
            }
        }
    }
    Ok(parsed)
}

fn parse_inet_address(kind: TransportKind, spec: &str, address: &str) -> Result<BindAddress, ConfigurationError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| ConfigurationError::MissingPort {
        spec: spec.to_string(),
    })?;

    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    let port = if port.is_empty() {
        kind.default_port().ok_or_else(|| ConfigurationError::InvalidPort {
            spec: spec.to_string(),
            port: port.to_string(),
        })?
    } else {
        port.parse::<u16>().map_err(|_| ConfigurationError::InvalidPort {
            spec: spec.to_string(),
            port: port.to_string(),
        })?
    };

    Ok(BindAddress::Inet {
        host: host.to_string(),
        port,
    })
}

fn parse_vsock_address(spec: &str, address: &str) -> Result<BindAddress, ConfigurationError> {
    let (cid, port) = address.split_once(':').ok_or_else(|| ConfigurationError::MissingPort {
        spec: spec.to_string(),
    })?;
    let cid = parse_vsock_cid(cid)?;
    let port = port.parse::<u32>().map_err(|_| ConfigurationError::InvalidPort {
        spec: spec.to_string(),
        port: port.to_string(),
    })?;
    Ok(BindAddress::Vsock { cid, port })
}

/// Numeric cid or one of the well-known names.
pub fn parse_vsock_cid(cid: &str) -> Result<u32, ConfigurationError> {
    let lower = cid.trim().to_ascii_lowercase();
    if let Some((_, value)) = CID_NAMES.iter().find(|(name, _)| *name == lower) {
        return Ok(*value);
    }
    lower.parse::<u32>().map_err(|_| ConfigurationError::InvalidVsockCid { cid: cid.to_string() })
}

fn parse_path_address(address: &str) -> Result<BindAddress, ConfigurationError> {
    if let Some(name) = address.strip_prefix('@') {
        validate_abstract_name(name)?;
    }
    Ok(BindAddress::Path {
        path: address.to_string(),
    })
}

/// Abstract socket names may only use alphanumerics, `-` and `_`.
pub fn validate_abstract_name(name: &str) -> Result<(), ConfigurationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ConfigurationError::InvalidAbstractName { name: name.to_string() });
    }
    Ok(())
}
