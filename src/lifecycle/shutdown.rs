//! Teardown of a running server's listeners.
//!
//! Accept loops subscribe to the stop signal and are registered here. On
//! shutdown mDNS records are withdrawn first, then the loops are told to
//! stop, every listener is released in creation order, and the loops are
//! joined.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bind::TransportKind;
use crate::lifecycle::ListenerSet;
use crate::mdns::PublisherHandle;

/// Owns the stop signal and the accept loops waiting on it.
pub struct Shutdown {
    stop: broadcast::Sender<()>,
    accept_loops: Vec<(TransportKind, JoinHandle<()>)>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            stop,
            accept_loops: Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.stop.subscribe()
    }

    /// Register the accept loop serving a listener of `kind`.
    pub fn register(&mut self, kind: TransportKind, accept_loop: JoinHandle<()>) {
        self.accept_loops.push((kind, accept_loop));
    }

    /// Accept loops that have not exited yet.
    pub fn running(&self) -> usize {
        self.accept_loops.iter().filter(|(_, task)| !task.is_finished()).count()
    }

    /// Withdraw publications, stop the accept loops and release `listeners`.
    /// Returns how many accept loops were joined.
    pub async fn run(self, listeners: &ListenerSet, publications: &mut [Box<dyn PublisherHandle>]) -> usize {
        for publication in publications.iter_mut() {
            publication.stop();
        }

        let _ = self.stop.send(());
        // Releasing the sockets also wakes loops parked in accept().
        listeners.cleanup_all();

        let mut joined = 0;
        for (kind, task) in self.accept_loops {
            match task.await {
                Ok(()) => joined += 1,
                Err(e) => tracing::warn!(kind = %kind, error = %e, "Accept loop ended abnormally"),
            }
        }
        tracing::debug!(joined, listeners = listeners.len(), "Listeners released");
        joined
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
