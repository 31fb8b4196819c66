//! Local socket path probing.
//!
//! # Responsibilities
//! - Classify a socket path as live, dead, undecided or inaccessible
//! - Re-probe undecided paths concurrently until they settle or time out
//!
//! # Design Decisions
//! - A probe is a bounded connect; nothing is ever sent
//! - Refused connections on a path are undecided (the server may be starting),
//!   on an abstract name they are dead (abstract names vanish with their owner)

use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::config::ProbeConfig;
use crate::observability::metrics;

/// Result of probing a local socket path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketPathState {
    /// A server accepted the probe connection.
    Live,
    /// Nothing is listening; the path may be reused.
    Dead,
    /// Could not be decided within the bound.
    Unknown,
    /// The path exists but we are not allowed to connect.
    Inaccessible,
}

impl SocketPathState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketPathState::Live => "LIVE",
            SocketPathState::Dead => "DEAD",
            SocketPathState::Unknown => "UNKNOWN",
            SocketPathState::Inaccessible => "INACCESSIBLE",
        }
    }

    /// Paths in these states belong to someone else and are never touched.
    pub fn blocks_reuse(&self) -> bool {
        matches!(self, SocketPathState::Live | SocketPathState::Inaccessible)
    }
}

impl fmt::Display for SocketPathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `@name` paths are Linux abstract socket names.
pub fn is_abstract(path: &str) -> bool {
    path.starts_with('@')
}

/// Map a failed connect to a state.
pub fn classify_connect_error(err: &io::Error, abstract_socket: bool) -> SocketPathState {
    match err.kind() {
        io::ErrorKind::PermissionDenied => SocketPathState::Inaccessible,
        io::ErrorKind::ConnectionRefused if abstract_socket => SocketPathState::Dead,
        io::ErrorKind::ConnectionRefused => SocketPathState::Unknown,
        io::ErrorKind::NotFound | io::ErrorKind::WouldBlock => SocketPathState::Dead,
        _ => SocketPathState::Unknown,
    }
}

/// Probes socket paths with the configured bounds.
#[derive(Debug, Clone)]
pub struct SocketPathProber {
    config: ProbeConfig,
}

impl SocketPathProber {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe once with the short bound.
    pub async fn probe(&self, path: &str) -> SocketPathState {
        let state = probe_path(path, self.config.short_timeout()).await;
        metrics::record_probe(state);
        tracing::debug!(path = %path, state = %state, "Socket path probed");
        state
    }

    /// Keep probing until the path is claimed by a server or the long bound expires.
    pub async fn wait_for_state(&self, path: &str) -> SocketPathState {
        let deadline = Instant::now() + self.config.long_timeout();
        loop {
            let state = probe_path(path, self.config.short_timeout()).await;
            let now = Instant::now();
            if state.blocks_reuse() || now >= deadline {
                metrics::record_probe(state);
                return state;
            }
            let pause = self.config.interval().min(deadline - now);
            time::sleep(pause).await;
        }
    }

    /// Re-probe every path in its own task and wait for all of them.
    pub async fn reprobe_all(&self, paths: Vec<String>) -> Vec<(String, SocketPathState)> {
        let mut tasks = JoinSet::new();
        for path in paths {
            let prober = self.clone();
            tasks.spawn(async move {
                let state = prober.wait_for_state(&path).await;
                (path, state)
            });
        }

        let bound = self.config.long_timeout() + self.config.short_timeout() + Duration::from_secs(1);
        let mut results = Vec::with_capacity(tasks.len());
        let joined = time::timeout(bound, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((path, state)) => {
                        tracing::debug!(path = %path, state = %state, "Socket path settled");
                        results.push((path, state));
                    }
                    Err(e) => tracing::warn!(error = %e, "Socket probe task failed"),
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!(pending = tasks.len(), "Socket probes did not finish in time");
            tasks.abort_all();
        }
        results
    }
}

async fn probe_path(path: &str, timeout: Duration) -> SocketPathState {
    if let Some(name) = path.strip_prefix('@') {
        return probe_abstract(name, timeout).await;
    }
    if !Path::new(path).exists() {
        return SocketPathState::Dead;
    }
    match time::timeout(timeout, UnixStream::connect(path)).await {
        Ok(Ok(_stream)) => SocketPathState::Live,
        Ok(Err(e)) => classify_connect_error(&e, false),
        Err(_) => SocketPathState::Unknown,
    }
}

#[cfg(target_os = "linux")]
async fn probe_abstract(name: &str, timeout: Duration) -> SocketPathState {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};

    let name = name.to_string();
    let connect = tokio::task::spawn_blocking(move || {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        StdUnixStream::connect_addr(&addr)
    });
    match time::timeout(timeout, connect).await {
        Ok(Ok(Ok(_stream))) => SocketPathState::Live,
        Ok(Ok(Err(e))) => classify_connect_error(&e, true),
        Ok(Err(_)) | Err(_) => SocketPathState::Unknown,
    }
}

#[cfg(not(target_os = "linux"))]
async fn probe_abstract(_name: &str, _timeout: Duration) -> SocketPathState {
    SocketPathState::Dead
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            short_timeout_ms: 100,
            long_timeout_ms: 300,
            interval_ms: 50,
        }
    }

    #[test]
    fn test_classification() {
        let err = |kind| io::Error::new(kind, "x");
        assert_eq!(
            classify_connect_error(&err(io::ErrorKind::PermissionDenied), false),
            SocketPathState::Inaccessible
        );
        assert_eq!(
            classify_connect_error(&err(io::ErrorKind::ConnectionRefused), false),
            SocketPathState::Unknown
        );
        assert_eq!(
            classify_connect_error(&err(io::ErrorKind::ConnectionRefused), true),
            SocketPathState::Dead
        );
        assert_eq!(classify_connect_error(&err(io::ErrorKind::NotFound), false), SocketPathState::Dead);
        assert_eq!(
            classify_connect_error(&err(io::ErrorKind::Other), false),
            SocketPathState::Unknown
        );
    }

    #[tokio::test]
    async fn test_missing_path_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let prober = SocketPathProber::new(fast_config());
        assert_eq!(prober.probe(path.to_str().unwrap()).await, SocketPathState::Dead);
    }

    #[tokio::test]
    async fn test_listening_path_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        let prober = SocketPathProber::new(fast_config());
        assert_eq!(prober.probe(path.to_str().unwrap()).await, SocketPathState::Live);
    }

    #[tokio::test]
    async fn test_stale_path_stays_unknown_until_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        let prober = SocketPathProber::new(fast_config());

        let path = path.to_str().unwrap();
        assert_eq!(prober.probe(path).await, SocketPathState::Unknown);

        let started = std::time::Instant::now();
        assert_eq!(prober.wait_for_state(path).await, SocketPathState::Unknown);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_blocking_states() {
        assert!(SocketPathState::Live.blocks_reuse());
        assert!(SocketPathState::Inaccessible.blocks_reuse());
        assert!(!SocketPathState::Dead.blocks_reuse());
        assert!(!SocketPathState::Unknown.blocks_reuse());
    }
}
