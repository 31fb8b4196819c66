//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Honour `RUST_LOG` over the configured level
//!
//! # Design Decisions
//! - Benign events (peer disconnects, retries) log at debug
//! - Cleanup failures log at warn and never propagate

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for a configured level.
pub fn default_filter(level: &str) -> String {
    format!("display_transport={level},transport_cli={level}", level = level)
}

/// Install the global subscriber. Returns false when one was already set.
pub fn init(level: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level).into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = default_filter("debug");
        assert!(filter.contains("display_transport=debug"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}
