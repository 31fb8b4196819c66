//! Display transport server.
//!
//! # Architecture Overview
//!
//! ```text
//!   config.toml ──▶ config::load_config ──▶ lifecycle::Bootstrap
//!                                               │
//!        ┌──────────────────────┬───────────────┼────────────────────┐
//!        ▼                      ▼               ▼                    ▼
//!   net::local            net::listener    net::listener        net::listener
//!   (probe + perms)       (tcp/ssl/ws..)   (vsock / pipes)      (quic, UDP)
//!        │                      │               │
//!        └──────────────────────┴───────┬───────┘
//!                                       ▼
//!                         ListenerHandle::accept loops
//!                                       │
//!                        tls::Handshake (ssl / wss only)
//!                                       │
//!                                       ▼
//!                         Connection ready for the packet layer
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use display_transport::config::{self, TransportConfig};
use display_transport::lifecycle::signals::wait_for_shutdown_signal;
use display_transport::mdns::{self, LogPublisher, PublisherHandle};
use display_transport::net::{Connection, ListenerError, ListenerHandle};
use display_transport::observability::{logging, metrics};
use display_transport::tls::{self, Handshake, HandshakeParams, TlsContext, TlsPolicy, TlsSide};
use display_transport::{Bootstrap, RuntimeContext, Shutdown};

#[derive(Parser)]
#[command(name = "display-transport")]
#[command(about = "Transport listeners for a remote display server", long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => TransportConfig::default(),
    };
    let level = args.log_level.as_deref().unwrap_or(&config.observability.log_level);
    logging::init(level);

    tracing::info!("display-transport v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let tls = if config.bind.ssl.is_empty() && config.bind.wss.is_empty() && config.bind.quic.is_empty() {
        None
    } else {
        tls::install_crypto_provider();
        let policy = TlsPolicy::from_config(&config.tls, TlsSide::Server);
        Some(tls::build_context(&policy)?)
    };

    let ctx = Arc::new(RuntimeContext::detect());
    tracing::debug!(context = ?ctx, "Runtime context detected");

    let bootstrap = Bootstrap::new(ctx, config.clone());
    let listeners = bootstrap.create_listeners().await?;

    let mut publications: Vec<Box<dyn PublisherHandle>> = Vec::new();
    if config.mdns.enabled {
        let name = mdns::instance_name(&config.mdns.service_name, config.local.display_name.as_deref());
        publications = mdns::publish_listeners(
            &LogPublisher,
            listeners.handles(),
            &name,
            tls.is_some(),
            &BTreeMap::new(),
        );
    }

    let mut shutdown = Shutdown::new();
    for handle in listeners.iter() {
        if handle.kind().is_datagram() {
            tracing::info!(kind = %handle.kind(), endpoint = %handle.local_endpoint(), "Datagram socket ready");
            continue;
        }
        let tls = if handle.kind().requires_tls() { tls.clone() } else { None };
        let accept = tokio::spawn(accept_loop(
            handle.clone(),
            tls,
            config.timeouts.connect(),
            shutdown.subscribe(),
        ));
        shutdown.register(handle.kind(), accept);
    }

    let signal = wait_for_shutdown_signal().await?;
    tracing::info!(signal, "Shutting down");

    shutdown.run(&listeners, &mut publications).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn accept_loop(
    handle: ListenerHandle,
    tls: Option<(TlsContext, HandshakeParams)>,
    handshake_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = handle.accept() => match result {
                Ok(connection) => {
                    tokio::spawn(handle_connection(connection, tls.clone(), handshake_timeout));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(kind = %handle.kind(), endpoint = %handle.local_endpoint(), error = %e, "Accept failed");
                }
            },
        }
    }
    tracing::debug!(kind = %handle.kind(), endpoint = %handle.local_endpoint(), "Accept loop stopped");
}

async fn handle_connection(
    connection: Connection,
    tls: Option<(TlsContext, HandshakeParams)>,
    handshake_timeout: Duration,
) {
    let connection = match tls {
        Some((context, params)) => {
            let peer = connection.peer.socket_addr();
            match Handshake::new(params, peer, handshake_timeout).secure(&context, connection).await {
                Ok(Some(connection)) => connection,
                Ok(None) | Err(_) => return,
            }
        }
        None => connection,
    };

    tracing::info!(
        id = %connection.id,
        kind = %connection.kind,
        peer = %connection.peer,
        local = %connection.local,
        tls = connection.tls.is_some(),
        "New connection"
    );
}
