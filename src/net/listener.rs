//! Listener creation and listener handles.
//!
//! # Responsibilities
//! - Resolve and bind inet stream and datagram endpoints
//! - Bind vsock endpoints and delegate named pipes to the platform layer
//! - Retry endpoints whose address is still in use, as one batch
//! - Give every endpoint a single idempotent cleanup path
//!
//! # Design Decisions
//! - Sockets are built with `socket2` so reuse and dual-stack flags are set before bind
//! - `accept()` never holds a lock across an await; cleanup can run at any time
//!   and wakes pending accepts

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::{mpsc, watch};

use crate::bind::{BindAddress, BindOptions, ListenerRequest, TransportKind};
use crate::config::ListenerConfig;
use crate::context::RuntimeContext;
use crate::error::{EndpointFailure, SocketCreationError};
use crate::net::connection::{Connection, Endpoint};
use crate::net::pipe::{PipeListener, PipeListenerFactory, PIPE_BACKLOG};
use crate::observability::metrics;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::net::vsock::VsockListener;

/// Backlog of every listening socket.
pub const LISTEN_BACKLOG: i32 = 5;

/// Option asking for a port-forwarding mapping.
pub const UPNP_OPTION: &str = "upnp";

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// The listener was cleaned up.
    Closed,
    /// This listener kind has no accept loop of its own.
    Unsupported(TransportKind),
    /// Failed to accept connection.
    Accept(io::Error),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Closed => write!(f, "Listener closed"),
            ListenerError::Unsupported(kind) => write!(f, "{} listeners do not accept connections", kind),
            ListenerError::Accept(e) => write!(f, "Failed to accept: {}", e),
        }
    }
}

impl std::error::Error for ListenerError {}

/// Removes a port-forwarding mapping.
pub type UnmapAction = Box<dyn FnOnce() + Send>;

/// Port-forwarding collaborator (e.g. UPnP).
pub trait PortMapper: Send + Sync {
    /// Map `local` and return the action removing the mapping.
    fn add_mapping(&self, kind: TransportKind, local: SocketAddr, options: &BindOptions) -> io::Result<UnmapAction>;
}

pub(crate) enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
    Udp(Arc<UdpSocket>),
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Vsock(VsockListener),
    Pipe {
        listener: Box<dyn PipeListener>,
        connections: mpsc::Receiver<Connection>,
    },
}

/// When a cleanup action runs relative to closing the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanupStage {
    BeforeClose,
    AfterClose,
}

struct Shared {
    socket: Mutex<Option<ListenerSocket>>,
    closed: watch::Sender<bool>,
    cleaned: AtomicBool,
    before_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    after_close: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A bound endpoint. Cloning shares the same socket.
#[derive(Clone)]
pub struct ListenerHandle {
    kind: TransportKind,
    local: Endpoint,
    shared: Arc<Shared>,
}

impl ListenerHandle {
    pub(crate) fn new(kind: TransportKind, local: Endpoint, socket: ListenerSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            kind,
            local,
            shared: Arc::new(Shared {
                socket: Mutex::new(Some(socket)),
                closed,
                cleaned: AtomicBool::new(false),
                before_close: Mutex::new(Vec::new()),
                after_close: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn add_cleanup(&self, stage: CleanupStage, action: Box<dyn FnOnce() + Send>) {
        let actions = match stage {
            CleanupStage::BeforeClose => &self.shared.before_close,
            CleanupStage::AfterClose => &self.shared.after_close,
        };
        lock(actions).push(action);
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Bound address, with the real port when port 0 was requested.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.socket_addr()
    }

    /// The bound UDP socket of a datagram listener, for the QUIC layer.
    pub fn datagram_socket(&self) -> Option<Arc<UdpSocket>> {
        match lock(&self.shared.socket).as_ref() {
            Some(ListenerSocket::Udp(socket)) => Some(Arc::clone(socket)),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cleaned.load(Ordering::SeqCst)
    }

    /// Wait for the next connection. Returns `Closed` once `cleanup` ran.
    pub async fn accept(&self) -> Result<Connection, ListenerError> {
        let mut closed = self.shared.closed.subscribe();
        if *closed.borrow() {
            return Err(ListenerError::Closed);
        }
        tokio::select! {
            result = poll_fn(|cx| self.poll_accept(cx)) => result,
            _ = closed.wait_for(|closed| *closed) => Err(ListenerError::Closed),
        }
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<Connection, ListenerError>> {
        let mut guard = lock(&self.shared.socket);
        let Some(socket) = guard.as_mut() else {
            return Poll::Ready(Err(ListenerError::Closed));
        };
        let kind = self.kind;
        let result = match socket {
            ListenerSocket::Tcp(listener) => match listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let local = stream.local_addr().map(Endpoint::from).unwrap_or_else(|_| self.local.clone());
                    Ok(Connection::new(kind, local, Endpoint::from(peer), stream))
                }
                Poll::Ready(Err(e)) => Err(ListenerError::Accept(e)),
                Poll::Pending => return Poll::Pending,
            },
            ListenerSocket::Unix(listener) => match listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    let peer = peer
                        .as_pathname()
                        .map(|path| Endpoint::Path {
                            path: path.to_string_lossy().into_owned(),
                        })
                        .unwrap_or(Endpoint::Unknown);
                    Ok(Connection::new(kind, self.local.clone(), peer, stream))
                }
                Poll::Ready(Err(e)) => Err(ListenerError::Accept(e)),
                Poll::Pending => return Poll::Pending,
            },
            #[cfg(any(target_os = "linux", target_os = "android"))]
            ListenerSocket::Vsock(listener) => match listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, (cid, port)))) => {
                    Ok(Connection::new(kind, self.local.clone(), Endpoint::Vsock { cid, port }, stream))
                }
                Poll::Ready(Err(e)) => Err(ListenerError::Accept(e)),
                Poll::Pending => return Poll::Pending,
            },
            ListenerSocket::Pipe { connections, .. } => match connections.poll_recv(cx) {
                Poll::Ready(Some(connection)) => Ok(connection),
                Poll::Ready(None) => Err(ListenerError::Closed),
                Poll::Pending => return Poll::Pending,
            },
            ListenerSocket::Udp(_) => Err(ListenerError::Unsupported(kind)),
        };
        Poll::Ready(result)
    }

    /// Release the endpoint: remove port mappings, close the socket, then
    /// run path removal. Safe to call repeatedly and from any task.
    pub fn cleanup(&self) {
        if self.shared.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closed.send_replace(true);

        let before: Vec<_> = lock(&self.shared.before_close).drain(..).collect();
        for action in before {
            action();
        }

        let socket = lock(&self.shared.socket).take();
        if let Some(ListenerSocket::Pipe { listener, .. }) = &socket {
            listener.stop();
        }
        drop(socket);

        let after: Vec<_> = lock(&self.shared.after_close).drain(..).collect();
        for action in after {
            action();
        }
        tracing::debug!(kind = %self.kind, endpoint = %self.local, "Listener cleaned up");
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("kind", &self.kind)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates listeners for inet, vsock and named-pipe requests.
#[derive(Clone)]
pub struct ListenerFactory {
    ctx: Arc<RuntimeContext>,
    config: ListenerConfig,
    port_mapper: Option<Arc<dyn PortMapper>>,
    pipes: Option<Arc<dyn PipeListenerFactory>>,
}

impl ListenerFactory {
    pub fn new(ctx: Arc<RuntimeContext>, config: ListenerConfig) -> Self {
        Self {
            ctx,
            config,
            port_mapper: None,
            pipes: None,
        }
    }

    pub fn with_port_mapper(mut self, mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(mapper);
        self
    }

    pub fn with_pipe_factory(mut self, pipes: Arc<dyn PipeListenerFactory>) -> Self {
        self.pipes = Some(pipes);
        self
    }

    /// Create every request, retrying address-in-use failures together.
    /// On failure nothing created by this batch is left open.
    pub async fn create_batch(&self, requests: Vec<ListenerRequest>) -> Result<Vec<ListenerHandle>, SocketCreationError> {
        let mut created = Vec::with_capacity(requests.len());
        let mut failures = Vec::new();
        let mut pending = requests;
        let mut attempt = 0;

        loop {
            let mut retry = Vec::new();
            for request in pending.drain(..) {
                match self.create(&request).await {
                    Ok(handle) => created.push(handle),
                    Err(e) if is_retryable(&e) => retry.push((request, e)),
                    Err(e) => {
                        metrics::record_listener_failure(request.kind);
                        failures.push(endpoint_failure(&request, &e));
                    }
                }
            }

            if retry.is_empty() {
                break;
            }
            if attempt >= self.config.retry_attempts {
                for (request, e) in &retry {
                    metrics::record_listener_failure(request.kind);
                    failures.push(endpoint_failure(request, e));
                }
                break;
            }

            attempt += 1;
            for (request, e) in &retry {
                tracing::warn!(
                    kind = %request.kind,
                    endpoint = %request.address,
                    error = %e,
                    attempt,
                    "Endpoint busy, retrying"
                );
            }
            tokio::time::sleep(self.config.retry_pause()).await;
            pending = retry.into_iter().map(|(request, _)| request).collect();
        }

        if failures.is_empty() {
            return Ok(created);
        }

        for handle in &created {
            handle.cleanup();
        }
        let error = SocketCreationError { failures };
        tracing::error!(error = %error, "Listener batch failed");
        Err(error)
    }

    /// Create one listener, single attempt.
    pub async fn create(&self, request: &ListenerRequest) -> io::Result<ListenerHandle> {
        let handle = match (&request.address, request.kind) {
            (BindAddress::Inet { host, port }, kind) if kind.is_stream() => {
                self.create_stream(kind, host, *port).await?
            }
            (BindAddress::Inet { host, port }, kind) if kind.is_datagram() => {
                self.create_datagram(kind, host, *port).await?
            }
            (BindAddress::Vsock { cid, port }, TransportKind::Vsock) => create_vsock(*cid, *port)?,
            (BindAddress::Path { path }, TransportKind::NamedPipe) => self.create_pipe(path, &request.options)?,
            (address, kind) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} listeners cannot bind {}", kind, address),
                ))
            }
        };

        if request.option_enabled(UPNP_OPTION) && request.kind.supports_port_mapping() {
            self.map_port(&handle, &request.options);
        }
        metrics::record_listener_created(request.kind);
        Ok(handle)
    }

    async fn create_stream(&self, kind: TransportKind, host: &str, port: u16) -> io::Result<ListenerHandle> {
        let addr = resolve(host, port).await?;
        let socket = bind_socket(addr, Type::STREAM, Protocol::TCP, self.ctx.dualstack_ipv6)?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(socket.into())?;
        let local = listener.local_addr()?;
        log_bound(kind, port, local);
        Ok(ListenerHandle::new(kind, Endpoint::from(local), ListenerSocket::Tcp(listener)))
    }

    async fn create_datagram(&self, kind: TransportKind, host: &str, port: u16) -> io::Result<ListenerHandle> {
        let addr = resolve(host, port).await?;
        let socket = bind_socket(addr, Type::DGRAM, Protocol::UDP, self.ctx.dualstack_ipv6)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        log_bound(kind, port, local);
        Ok(ListenerHandle::new(
            kind,
            Endpoint::from(local),
            ListenerSocket::Udp(Arc::new(socket)),
        ))
    }

    fn create_pipe(&self, name: &str, options: &BindOptions) -> io::Result<ListenerHandle> {
        let Some(pipes) = &self.pipes else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "named pipes need a platform pipe listener",
            ));
        };
        let (tx, rx) = mpsc::channel(PIPE_BACKLOG);
        let listener = pipes.create(name, options, tx)?;
        tracing::info!(pipe = %listener.pipe_name(), "Named pipe listener started");
        let local = Endpoint::Pipe {
            name: listener.pipe_name().to_string(),
        };
        Ok(ListenerHandle::new(
            TransportKind::NamedPipe,
            local,
            ListenerSocket::Pipe {
                listener,
                connections: rx,
            },
        ))
    }

    fn map_port(&self, handle: &ListenerHandle, options: &BindOptions) {
        let Some(local) = handle.local_addr() else {
            return;
        };
        let Some(mapper) = &self.port_mapper else {
            tracing::warn!(endpoint = %local, "Port mapping requested but no port mapper is available");
            return;
        };
        match mapper.add_mapping(handle.kind(), local, options) {
            Ok(unmap) => {
                tracing::info!(kind = %handle.kind(), endpoint = %local, "Port mapping added");
                handle.add_cleanup(CleanupStage::BeforeClose, unmap);
            }
            Err(e) => tracing::warn!(endpoint = %local, error = %e, "Port mapping failed"),
        }
    }
}

fn log_bound(kind: TransportKind, requested_port: u16, local: SocketAddr) {
    if requested_port == 0 {
        tracing::info!(kind = %kind, port = local.port(), "Allocated {} port", kind);
    }
    tracing::info!(kind = %kind, address = %local, "Listener bound");
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable
    )
}

fn endpoint_failure(request: &ListenerRequest, err: &io::Error) -> EndpointFailure {
    EndpointFailure {
        kind: request.kind,
        endpoint: request.address.to_string(),
        error: err.to_string(),
    }
}

/// Resolve a host (literal, bracketed literal or name) to the address to bind.
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let wants_v6 = host.contains(':');
    addrs
        .iter()
        .find(|addr| addr.is_ipv6() == wants_v6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address found for '{}'", host)))
}

fn bind_socket(addr: SocketAddr, ty: Type, protocol: Protocol, dualstack: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    if ty == Type::STREAM {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() && addr.ip().is_unspecified() {
        socket.set_only_v6(!dualstack)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_vsock(cid: u32, port: u32) -> io::Result<ListenerHandle> {
    let listener = VsockListener::bind(cid, port)?;
    let (cid, port) = listener.local_address();
    tracing::info!(cid, port, "vsock listener bound");
    Ok(ListenerHandle::new(
        TransportKind::Vsock,
        Endpoint::Vsock { cid, port },
        ListenerSocket::Vsock(listener),
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_vsock(_cid: u32, _port: u32) -> io::Result<ListenerHandle> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "vsock is not available"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::parse_bind_spec;

    fn factory() -> ListenerFactory {
        ListenerFactory::new(
            Arc::new(RuntimeContext::detect()),
            ListenerConfig {
                min_port: 0,
                retry_attempts: 1,
                retry_pause_ms: 50,
            },
        )
    }

    fn request(kind: TransportKind, spec: &str) -> ListenerRequest {
        let ctx = RuntimeContext::detect();
        parse_bind_spec(kind, spec).unwrap().to_requests(&ctx).remove(0)
    }

    #[tokio::test]
    async fn test_port_zero_is_read_back() {
        let handle = factory().create(&request(TransportKind::Tcp, "127.0.0.1:0")).await.unwrap();
        let addr = handle.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        handle.cleanup();
    }

    #[tokio::test]
    async fn test_datagram_listener_exposes_socket() {
        let handle = factory().create(&request(TransportKind::Quic, "127.0.0.1:0")).await.unwrap();
        assert!(handle.datagram_socket().is_some());
        assert!(matches!(handle.accept().await, Err(ListenerError::Unsupported(TransportKind::Quic))));
        handle.cleanup();
        assert!(handle.datagram_socket().is_none());
    }

    #[tokio::test]
    async fn test_busy_port_fails_after_retries() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();
        let started = std::time::Instant::now();
        let err = factory()
            .create_batch(vec![request(TransportKind::Tcp, &format!("127.0.0.1:{}", port))])
            .await
            .unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(err.failures[0].endpoint.contains(&port.to_string()));
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_failed_batch_releases_created_listeners() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let free_port = free.local_addr().unwrap().port();
        drop(free);

        let requests = vec![
            request(TransportKind::Tcp, &format!("127.0.0.1:{}", free_port)),
            request(TransportKind::Tcp, &format!("127.0.0.1:{}", busy_port)),
        ];
        assert!(factory().create_batch(requests).await.is_err());
        // the free port was bound then released again
        assert!(std::net::TcpListener::bind(("127.0.0.1", free_port)).is_ok());
    }

    #[tokio::test]
    async fn test_named_pipe_without_platform_support() {
        let err = factory()
            .create(&request(TransportKind::NamedPipe, "display-0"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_resolve_literals() {
        assert_eq!(
            resolve("[::1]", 5).await.unwrap(),
            "[::1]:5".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("127.0.0.1", 5).await.unwrap(),
            "127.0.0.1:5".parse::<SocketAddr>().unwrap()
        );
    }
}
