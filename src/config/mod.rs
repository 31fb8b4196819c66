//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (bind specs, TLS tokens, ranges)
//!     → TransportConfig (validated, immutable)
//!     → borrowed by the listener factory, TLS builder and trust store
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{expand_user, load_config, ConfigError};
pub use schema::{
    BindConfig, ListenerConfig, LocalSocketConfig, MdnsConfig, ObservabilityConfig, ProbeConfig, TimeoutConfig,
    TlsConfig, TransportConfig, TrustConfig,
};
