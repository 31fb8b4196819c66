//! Startup orchestration.
//!
//! # Responsibilities
//! - Parse every configured bind spec before any socket exists
//! - Create listeners in order: local sockets, inet, vsock and pipes, quic
//! - Leave nothing bound when any stage fails
//!
//! # Design Decisions
//! - Fail fast: any creation error is fatal
//! - Inet stream listeners are created as one batch so busy ports are
//!   retried together

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bind::{parse_bind_specs, BindSpec, ListenerRequest, TransportKind};
use crate::config::TransportConfig;
use crate::context::RuntimeContext;
use crate::error::{BootstrapError, ConfigurationError};
use crate::net::{ListenerFactory, ListenerHandle, LocalSocketManager, PipeListenerFactory, PortMapper};

const INET_STREAM_KINDS: [TransportKind; 6] = [
    TransportKind::Tcp,
    TransportKind::Ssl,
    TransportKind::Ssh,
    TransportKind::Ws,
    TransportKind::Wss,
    TransportKind::Rfb,
];

/// Parsed bind specs grouped by transport kind.
pub type SpecTable = BTreeMap<TransportKind, Vec<BindSpec>>;

/// Creates every configured listener.
pub struct Bootstrap {
    ctx: Arc<RuntimeContext>,
    config: TransportConfig,
    factory: ListenerFactory,
    local: LocalSocketManager,
}

impl Bootstrap {
    pub fn new(ctx: Arc<RuntimeContext>, config: TransportConfig) -> Self {
        let factory = ListenerFactory::new(Arc::clone(&ctx), config.listener.clone());
        let local = LocalSocketManager::new(Arc::clone(&ctx), config.local.clone(), config.probe.clone());
        Self {
            ctx,
            config,
            factory,
            local,
        }
    }

    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.factory = self.factory.with_port_mapper(mapper);
        self
    }

    pub fn with_pipe_factory(mut self, pipes: Arc<dyn PipeListenerFactory>) -> Self {
        self.factory = self.factory.with_pipe_factory(pipes);
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn local_sockets(&self) -> &LocalSocketManager {
        &self.local
    }

    /// Parse all bind lists and apply the minimum port check.
    pub fn parse_specs(&self) -> Result<SpecTable, ConfigurationError> {
        let mut table = SpecTable::new();
        for kind in TransportKind::ALL {
            let specs = parse_bind_specs(kind, self.config.bind.specs(kind))?;
            for spec in &specs {
                spec.check_min_port(self.config.listener.min_port)?;
            }
            if !specs.is_empty() {
                table.insert(kind, specs);
            }
        }
        Ok(table)
    }

    /// Create every listener. On error, everything created so far is
    /// cleaned up before returning.
    pub async fn create_listeners(&self) -> Result<ListenerSet, BootstrapError> {
        let specs = self.parse_specs()?;
        let mut set = ListenerSet::default();

        if let Err(e) = self.create_stages(&specs, &mut set).await {
            tracing::error!(error = %e, created = set.len(), "Startup failed, releasing listeners");
            set.cleanup_all();
            return Err(e);
        }

        tracing::info!(listeners = set.len(), "All listeners created");
        Ok(set)
    }

    async fn create_stages(&self, specs: &SpecTable, set: &mut ListenerSet) -> Result<(), BootstrapError> {
        if let Some(local) = specs.get(&TransportKind::Socket) {
            set.extend(self.local.create_listeners(local).await?);
        }

        let inet = self.requests(specs, &INET_STREAM_KINDS);
        if !inet.is_empty() {
            set.extend(self.factory.create_batch(inet).await?);
        }

        let platform = self.requests(specs, &[TransportKind::Vsock, TransportKind::NamedPipe]);
        if !platform.is_empty() {
            set.extend(self.factory.create_batch(platform).await?);
        }

        let quic = self.requests(specs, &[TransportKind::Quic]);
        if !quic.is_empty() {
            set.extend(self.factory.create_batch(quic).await?);
        }
        Ok(())
    }

    fn requests(&self, specs: &SpecTable, kinds: &[TransportKind]) -> Vec<ListenerRequest> {
        kinds
            .iter()
            .filter_map(|kind| specs.get(kind))
            .flatten()
            .flat_map(|spec| spec.to_requests(&self.ctx))
            .collect()
    }
}

/// Listeners owned by a running server.
#[derive(Debug, Default)]
pub struct ListenerSet {
    handles: Vec<ListenerHandle>,
}

impl ListenerSet {
    pub fn handles(&self) -> &[ListenerHandle] {
        &self.handles
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerHandle> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn requires_tls(&self) -> bool {
        self.handles.iter().any(|h| h.kind().requires_tls())
    }

    fn extend(&mut self, handles: Vec<ListenerHandle>) {
        self.handles.extend(handles);
    }

    /// Release every listener in creation order.
    pub fn cleanup_all(&self) {
        for handle in &self.handles {
            handle.cleanup();
        }
    }
}

impl From<Vec<ListenerHandle>> for ListenerSet {
    fn from(handles: Vec<ListenerHandle>) -> Self {
        Self { handles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<RuntimeContext> {
        Arc::new(RuntimeContext {
            ipv6: false,
            dualstack_ipv6: false,
            uid: 1000,
            privileged: false,
            group_ids: vec![1000],
            vsock: false,
        })
    }

    #[test]
    fn test_parse_specs_groups_by_kind() {
        let mut config = TransportConfig::default();
        config.bind.tcp = vec!["127.0.0.1:10000".into(), "127.0.0.1:10000".into()];
        config.bind.ws = vec![":10001".into()];
        let table = Bootstrap::new(ctx(), config).parse_specs().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&TransportKind::Tcp].len(), 1);
        assert_eq!(table[&TransportKind::Ws].len(), 1);
    }

    #[test]
    fn test_parse_specs_min_port() {
        let mut config = TransportConfig::default();
        config.bind.tcp = vec!["127.0.0.1:80".into()];
        let err = Bootstrap::new(ctx(), config).parse_specs().unwrap_err();
        assert!(matches!(err, ConfigurationError::PortBelowMinimum { port: 80, .. }));
    }

    #[test]
    fn test_wildcard_expands_per_context() {
        let mut config = TransportConfig::default();
        config.bind.tcp = vec!["*:10000".into()];
        let bootstrap = Bootstrap::new(ctx(), config);
        let table = bootstrap.parse_specs().unwrap();
        let requests = bootstrap.requests(&table, &INET_STREAM_KINDS);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].address.to_string(), "0.0.0.0:10000");
    }

    #[tokio::test]
    async fn test_failed_batch_releases_earlier_stages() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let busy = taken.local_addr().unwrap().port();

        let mut config = TransportConfig::default();
        config.listener.min_port = 0;
        config.listener.retry_attempts = 0;
        config.bind.tcp = vec!["127.0.0.1:0".into()];
        config.bind.quic = vec![format!("127.0.0.1:{}", busy)];

        let err = Bootstrap::new(ctx(), config).create_listeners().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Creation(_)));
        assert!(err.to_string().contains("quic"));
    }
}
