//! Named pipe boundary.
//!
//! Named pipes only exist on Windows. The platform layer supplies a
//! `PipeListenerFactory`; its listener runs the acceptance loop and pushes
//! new connections into the channel it is given.

use std::io;

use tokio::sync::mpsc;

use crate::bind::BindOptions;
use crate::net::connection::Connection;

/// Capacity of the channel between a pipe acceptance loop and `accept()`.
pub const PIPE_BACKLOG: usize = 16;

/// A running named-pipe acceptance loop.
pub trait PipeListener: Send + Sync {
    /// Full pipe name, e.g. `\\.\pipe\display-0`.
    fn pipe_name(&self) -> &str;

    /// Stop accepting. Must be idempotent.
    fn stop(&self);
}

/// Creates pipe listeners.
pub trait PipeListenerFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        options: &BindOptions,
        connections: mpsc::Sender<Connection>,
    ) -> io::Result<Box<dyn PipeListener>>;
}
