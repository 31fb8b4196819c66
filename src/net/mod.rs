//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerRequest (inet / vsock / named pipe)
//!     → listener.rs (bind with retry, ListenerHandle)
//! Local socket specs
//!     → local.rs (probe.rs + permissions.rs, then bind)
//!
//! ListenerHandle::accept()
//!     → connection.rs (Connection: stream + endpoints)
//!     → tls::Handshake for ssl / wss
//!     → hand off to the packet layer
//! ```
//!
//! # Design Decisions
//! - Every endpoint has exactly one release path: `ListenerHandle::cleanup`
//! - Paths owned by another server are never unlinked
//! - Platform-only transports (named pipes) sit behind traits

pub mod connection;
pub mod listener;
pub mod local;
pub mod permissions;
pub mod pipe;
pub mod probe;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod vsock;

pub use connection::{AsyncStream, Connection, ConnectionId, ConnectionMeta, Endpoint};
pub use listener::{ListenerError, ListenerFactory, ListenerHandle, PortMapper, UnmapAction};
pub use local::LocalSocketManager;
pub use permissions::PermissionManager;
pub use pipe::{PipeListener, PipeListenerFactory};
pub use probe::{SocketPathProber, SocketPathState};
