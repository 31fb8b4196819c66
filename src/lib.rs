//! Display server transport layer.
//!
//! Parses bind specs, creates listeners for every supported transport,
//! guards local socket paths, and secures connections with TLS including a
//! confirm-and-retry trust workflow for clients.

pub mod bind;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod mdns;
pub mod net;
pub mod observability;
pub mod tls;
pub mod trust;

pub use config::TransportConfig;
pub use context::RuntimeContext;
pub use error::{BootstrapError, ConfigurationError, ConnectError};
pub use lifecycle::{Bootstrap, ListenerSet, Shutdown};
