//! Trust decisions for TLS client connections.
//!
//! # Responsibilities
//! - Persist per-endpoint TLS overrides (store.rs)
//! - Ask the user about fixable verification failures (prompt.rs)
//! - Retry a failed handshake once with the accepted override (workflow.rs)

pub mod prompt;
pub mod store;
pub mod workflow;

pub use prompt::{Confirm, TerminalConfirm};
pub use store::{TrustDecisionStore, TrustException, TRUST_ATTRIBUTES};
pub use workflow::{fetch_peer_certificate, TrustedConnector};
