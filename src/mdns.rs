//! mDNS publication boundary.
//!
//! Only the collaborator interface lives here: a `MdnsPublisher` announces
//! `(host, port)` records for one mode and returns a handle that withdraws
//! them. `publish_listeners` derives the records from live listeners.

use std::collections::BTreeMap;
use std::io;

use crate::bind::TransportKind;
use crate::net::ListenerHandle;

/// Withdraws a publication when stopped.
pub trait PublisherHandle: Send {
    fn stop(&mut self);
}

pub trait MdnsPublisher: Send + Sync {
    fn publish(
        &self,
        listen_on: &[(String, u16)],
        name: &str,
        mode: &str,
        text: &BTreeMap<String, String>,
    ) -> io::Result<Box<dyn PublisherHandle>>;
}

/// Modes a listener of `kind` is announced under. Transports that cannot
/// be reached from another host are not announced.
pub fn mdns_modes(kind: TransportKind, tls_available: bool) -> Vec<&'static str> {
    match kind {
        TransportKind::Vsock | TransportKind::NamedPipe | TransportKind::Socket => Vec::new(),
        TransportKind::Tcp if tls_available => vec!["tcp", "ssl"],
        TransportKind::Ws if tls_available => vec!["ws", "wss"],
        kind => vec![kind.as_str()],
    }
}

/// Service instance name: the configured name or the hostname, followed by
/// the display name when there is one.
pub fn instance_name(service_name: &str, display_name: Option<&str>) -> String {
    let base = if service_name.is_empty() {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "display-transport".to_string())
    } else {
        service_name.to_string()
    };
    match display_name {
        Some(display) if !display.is_empty() => format!("{} {}", base, display),
        _ => base,
    }
}

/// Publish every listener with a network address, one publication per mode.
/// Failures are logged and skipped.
pub fn publish_listeners(
    publisher: &dyn MdnsPublisher,
    listeners: &[ListenerHandle],
    name: &str,
    tls_available: bool,
    text: &BTreeMap<String, String>,
) -> Vec<Box<dyn PublisherHandle>> {
    let mut records: BTreeMap<&'static str, Vec<(String, u16)>> = BTreeMap::new();
    for listener in listeners {
        let Some(addr) = listener.local_addr() else {
            continue;
        };
        for mode in mdns_modes(listener.kind(), tls_available) {
            let record = (addr.ip().to_string(), addr.port());
            let entries = records.entry(mode).or_default();
            if !entries.contains(&record) {
                entries.push(record);
            }
        }
    }

    let mut handles = Vec::new();
    for (mode, listen_on) in records {
        let mut text = text.clone();
        text.insert("mode".to_string(), mode.to_string());
        match publisher.publish(&listen_on, name, mode, &text) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::warn!(mode, error = %e, "Failed to publish mDNS records"),
        }
    }
    handles
}

/// Publisher that only logs the records it would announce.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

struct LogHandle {
    name: String,
    mode: String,
}

impl PublisherHandle for LogHandle {
    fn stop(&mut self) {
        tracing::info!(name = %self.name, mode = %self.mode, "Withdrew mDNS records");
    }
}

impl MdnsPublisher for LogPublisher {
    fn publish(
        &self,
        listen_on: &[(String, u16)],
        name: &str,
        mode: &str,
        text: &BTreeMap<String, String>,
    ) -> io::Result<Box<dyn PublisherHandle>> {
        tracing::info!(name, mode, records = ?listen_on, text = ?text, "Publishing mDNS records");
        Ok(Box::new(LogHandle {
            name: name.to_string(),
            mode: mode.to_string(),
        }))
    }
}
