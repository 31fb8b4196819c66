use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use display_transport::bind::{parse_bind_specs, TransportKind};
use display_transport::config::{self, TransportConfig};
use display_transport::net::SocketPathProber;
use display_transport::observability::logging;
use display_transport::tls::{self, TlsSide};
use display_transport::trust::{TerminalConfirm, TrustedConnector};
use display_transport::RuntimeContext;

#[derive(Parser)]
#[command(name = "transport-cli")]
#[command(about = "Inspect and test display transport endpoints", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Tcp,
    Ssl,
    Ssh,
    Ws,
    Wss,
    Rfb,
    Quic,
    Vsock,
    Socket,
    NamedPipe,
}

impl From<Kind> for TransportKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Tcp => TransportKind::Tcp,
            Kind::Ssl => TransportKind::Ssl,
            Kind::Ssh => TransportKind::Ssh,
            Kind::Ws => TransportKind::Ws,
            Kind::Wss => TransportKind::Wss,
            Kind::Rfb => TransportKind::Rfb,
            Kind::Quic => TransportKind::Quic,
            Kind::Vsock => TransportKind::Vsock,
            Kind::Socket => TransportKind::Socket,
            Kind::NamedPipe => TransportKind::NamedPipe,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Parse bind specs and print the listener requests as JSON
    Parse {
        #[arg(value_enum)]
        kind: Kind,
        specs: Vec<String>,
    },
    /// Report whether a local socket path has a live server
    Probe {
        paths: Vec<String>,
        /// Keep probing while the state is undecided
        #[arg(long)]
        wait: bool,
    },
    /// Open a TLS connection, asking before trusting an unknown certificate
    Connect {
        host: String,
        port: u16,
        /// Never prompt; fixable failures are fatal
        #[arg(long)]
        no_prompt: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => TransportConfig::default(),
    };

    match cli.command {
        Commands::Parse { kind, specs } => {
            let ctx = RuntimeContext::detect();
            let specs = parse_bind_specs(kind.into(), &specs)?;
            let requests: Vec<_> = specs.iter().flat_map(|spec| spec.to_requests(&ctx)).collect();
            println!("{}", serde_json::to_string_pretty(&json!({ "specs": specs, "requests": requests }))?);
        }
        Commands::Probe { paths, wait } => {
            let prober = SocketPathProber::new(config.probe.clone());
            let results = if wait {
                prober.reprobe_all(paths).await
            } else {
                let mut results = Vec::with_capacity(paths.len());
                for path in paths {
                    let state = prober.probe(&path).await;
                    results.push((path, state));
                }
                results
            };
            for (path, state) in results {
                println!("{}\t{}", state, path);
            }
        }
        Commands::Connect { host, port, no_prompt } => {
            tls::install_crypto_provider();
            let mut connector = TrustedConnector::from_config(&config);
            if !no_prompt {
                connector = connector.with_confirm(TerminalConfirm);
            }
            let connection = connector.connect(&host, port).await?;
            let session = connection.tls.clone();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "connection": connection.id.as_u64(),
                    "local": connection.local,
                    "peer": connection.peer,
                    "side": TlsSide::Client,
                    "tls": session,
                }))?
            );
        }
    }

    Ok(())
}
