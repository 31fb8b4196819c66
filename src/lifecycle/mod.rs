//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Parse bind specs → Local sockets → Inet → Vsock/pipes → QUIC
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Withdraw mDNS → Stop accept loops → Clean up listeners → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then listeners by stage
//! - Ordered shutdown: stop accepting, then release endpoints in creation order

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Bootstrap, ListenerSet};
