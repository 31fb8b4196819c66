//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! TlsConfig / trust attributes
//!     → policy.rs (TlsPolicy: validated option tokens)
//!     → context.rs (build_context: acceptor or connector)
//!     → handshake.rs (Handshake: secure a Connection, classify failures)
//!
//! certs.rs: PEM loading, CA resolution, fingerprints
//! verifier.rs: server verification with verify codes
//! ```
//!
//! # Design Decisions
//! - rustls with the ring provider; no OpenSSL dependency
//! - Option vocabularies are validated before any context is built

use std::sync::Once;

pub mod certs;
pub mod context;
pub mod handshake;
pub mod policy;
pub mod verifier;

pub use context::{build_context, crypto_provider, HandshakeParams, TlsContext};
pub use handshake::{FailureKind, Handshake, HandshakeFailure, HandshakeOutcome, HandshakeState, TlsSessionInfo};
pub use policy::{TlsPolicy, TlsSide, VerifyMode};
pub use verifier::{AcceptAnyServerCert, PolicyServerVerifier, VerifyCodeError};

static INIT_PROVIDER: Once = Once::new();

/// Install ring as the process-wide rustls provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    INIT_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
