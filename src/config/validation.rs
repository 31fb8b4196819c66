//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Parse every bind spec so bad specs fail before any socket exists
//! - Check TLS vocabulary tokens and value ranges
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::bind::{parse_bind_specs, TransportKind};
use crate::config::schema::TransportConfig;
use crate::net::permissions::parse_socket_mode;
use crate::tls::policy;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            field: field.into(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate the whole configuration.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for kind in TransportKind::ALL {
        let field = format!("bind.{}", kind.as_str().replace('-', "_"));
        match parse_bind_specs(kind, config.bind.specs(kind)) {
            Ok(specs) => {
                for spec in specs {
                    if let Err(e) = spec.check_min_port(config.listener.min_port) {
                        errors.push(ValidationError::new(&field, e));
                    }
                }
            }
            Err(e) => errors.push(ValidationError::new(&field, e)),
        }
    }

    if let Err(e) = parse_socket_mode(&config.local.socket_permissions) {
        errors.push(ValidationError::new("local.socket_permissions", e));
    }
    if config.local.shared_dir_mode > 0o777 {
        errors.push(ValidationError::new(
            "local.shared_dir_mode",
            format!("{:o} is not a valid mode", config.local.shared_dir_mode),
        ));
    }

    let probe = &config.probe;
    if probe.short_timeout_ms == 0 || probe.long_timeout_ms == 0 {
        errors.push(ValidationError::new("probe", "timeouts must be greater than zero"));
    } else if probe.short_timeout_ms > probe.long_timeout_ms {
        errors.push(ValidationError::new(
            "probe.short_timeout_ms",
            "must not exceed probe.long_timeout_ms",
        ));
    }

    let tls = &config.tls;
    let token_checks = [
        ("tls.protocol", policy::parse_protocol(&tls.protocol).err()),
        ("tls.client_verify_mode", policy::VerifyMode::parse(&tls.client_verify_mode).err()),
        ("tls.server_verify_mode", policy::VerifyMode::parse(&tls.server_verify_mode).err()),
        ("tls.verify_flags", policy::parse_verify_flags(&tls.verify_flags).err()),
        ("tls.options", policy::parse_options(&tls.options).err()),
        ("tls.ciphers", policy::parse_ciphers(&tls.ciphers).err()),
    ];
    for (field, error) in token_checks {
        if let Some(e) = error {
            errors.push(ValidationError::new(field, e));
        }
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::new("timeouts.connect_secs", "must be greater than zero"));
    }

    if config.observability.metrics_enabled && config.observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&TransportConfig::default()).is_ok());
    }

    #[test]
    fn test_min_port_is_enforced() {
        let mut config = TransportConfig::default();
        config.bind.ws.push("0.0.0.0:80".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "bind.ws");
    }

    #[test]
    fn test_unknown_tls_tokens_are_reported() {
        let mut config = TransportConfig::default();
        config.tls.protocol = "SSLv3".into();
        config.tls.server_verify_mode = "sometimes".into();
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["tls.protocol", "tls.server_verify_mode"]);
        assert!(errors[0].message.contains("TLSv1_3"));
    }

    #[test]
    fn test_probe_bounds() {
        let mut config = TransportConfig::default();
        config.probe.short_timeout_ms = 10_000;
        assert!(validate_config(&config).is_err());
    }
}
