//! Local (unix domain) socket setup.
//!
//! # Data Flow
//! ```text
//! socket specs
//!     → resolve_paths (auto, @abstract, relative, directory)
//!     → short probe per path ── LIVE / INACCESSIBLE ──→ SocketConflictError
//!     → UNKNOWN paths re-probed concurrently (one task each)
//!     → short re-check, stale paths unlinked
//!     → bind, chmod, chgrp → ListenerHandle (inode-guarded unlink on cleanup)
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;

use crate::bind::{BindAddress, BindOptions, BindSpec, TransportKind};
use crate::config::{expand_user, LocalSocketConfig, ProbeConfig};
use crate::context::RuntimeContext;
use crate::error::{BootstrapError, ConfigurationError, SocketConflictError, SocketCreationError};
use crate::net::connection::Endpoint;
use crate::net::listener::{CleanupStage, ListenerHandle, ListenerSocket};
use crate::net::permissions::PermissionManager;
use crate::net::probe::{is_abstract, SocketPathProber, SocketPathState};
use crate::observability::metrics;

const APP_DIR: &str = "display-transport";

/// Creates local socket listeners without disturbing running servers.
#[derive(Debug, Clone)]
pub struct LocalSocketManager {
    config: LocalSocketConfig,
    prober: SocketPathProber,
    permissions: PermissionManager,
}

impl LocalSocketManager {
    pub fn new(ctx: Arc<RuntimeContext>, config: LocalSocketConfig, probe: ProbeConfig) -> Self {
        Self {
            permissions: PermissionManager::new(ctx, config.clone()),
            prober: SocketPathProber::new(probe),
            config,
        }
    }

    pub fn prober(&self) -> &SocketPathProber {
        &self.prober
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    /// Directory for relative socket names.
    pub fn socket_dir(&self) -> PathBuf {
        if !self.config.socket_dir.is_empty() {
            return expand_user(&self.config.socket_dir);
        }
        match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(runtime) if !runtime.is_empty() => PathBuf::from(runtime).join(APP_DIR),
            _ => PathBuf::from(format!("/tmp/{}-{}", APP_DIR, nix::unistd::getuid())),
        }
    }

    fn display_name(&self, spec: &str) -> Result<String, ConfigurationError> {
        self.config
            .display_name
            .as_deref()
            .map(|name| name.trim_start_matches(':').to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigurationError::MissingDisplayName { spec: spec.to_string() })
    }

    /// Turn socket specs into concrete paths, dropping duplicates.
    pub fn resolve_paths(&self, specs: &[BindSpec]) -> Result<Vec<(String, BindOptions)>, ConfigurationError> {
        let mut resolved: Vec<(String, BindOptions)> = Vec::new();
        let mut push = |path: String, options: &BindOptions| {
            if resolved.iter().any(|(existing, _)| *existing == path) {
                tracing::debug!(path = %path, "Duplicate socket path ignored");
            } else {
                resolved.push((path, options.clone()));
            }
        };

        for spec in specs {
            let BindAddress::Path { path } = &spec.address else {
                continue;
            };
            match path.as_str() {
                "" | "none" => {}
                "auto" => {
                    let display = self.display_name(path)?;
                    push(self.socket_dir().join(&display).to_string_lossy().into_owned(), &spec.options);
                    if self.config.abstract_sockets {
                        push(format!("@{}-{}", APP_DIR, abstract_safe(&display)), &spec.options);
                    }
                }
                p if is_abstract(p) => push(p.to_string(), &spec.options),
                p if p.ends_with('/') || Path::new(p).is_dir() => {
                    let display = self.display_name(p)?;
                    push(expand_user(p).join(display).to_string_lossy().into_owned(), &spec.options);
                }
                p if !p.contains('/') => {
                    push(self.socket_dir().join(p).to_string_lossy().into_owned(), &spec.options);
                }
                p => push(expand_user(p).to_string_lossy().into_owned(), &spec.options),
            }
        }
        Ok(resolved)
    }

    /// Probe, clear and bind every local socket spec.
    pub async fn create_listeners(&self, specs: &[BindSpec]) -> Result<Vec<ListenerHandle>, BootstrapError> {
        let entries = self.resolve_paths(specs)?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut undecided = Vec::new();
        for (path, _) in &entries {
            if is_abstract(path) {
                let state = self.prober.probe(path).await;
                if state.blocks_reuse() {
                    return Err(conflict(path, state));
                }
                continue;
            }

            if let Some(parent) = Path::new(path).parent() {
                if let Err(e) = self.permissions.ensure_socket_dir(parent) {
                    tracing::warn!(dir = %parent.display(), error = %e, "Cannot prepare socket directory");
                }
            }

            if self.config.clobber {
                remove_path(path);
                continue;
            }

            match self.prober.probe(path).await {
                state if state.blocks_reuse() => return Err(conflict(path, state)),
                SocketPathState::Unknown => undecided.push(path.clone()),
                _ => remove_stale_socket(path),
            }
        }

        if !undecided.is_empty() {
            tracing::info!(count = undecided.len(), "Waiting for undecided socket paths");
            self.prober.reprobe_all(undecided).await;
            // Paths that were free before the wait may have been taken since.
            for (path, _) in entries.iter().filter(|(path, _)| !is_abstract(path)) {
                let state = self.prober.probe(path).await;
                if state.blocks_reuse() {
                    return Err(conflict(path, state));
                }
                remove_stale_socket(path);
            }
        }

        let mut created: Vec<ListenerHandle> = Vec::with_capacity(entries.len());
        for (path, options) in &entries {
            let result = match self.permissions.socket_mode(options) {
                Ok(mode) => self.create_one(path, mode).map_err(|e| (e, path)),
                Err(e) => {
                    release(&created);
                    return Err(e.into());
                }
            };
            match result {
                Ok(handle) => created.push(handle),
                Err((e, path)) => {
                    let shared = Path::new(path).parent().map(|dir| self.permissions.is_shared_dir(dir)).unwrap_or(false);
                    if is_abstract(path) || shared {
                        tracing::warn!(path = %path, error = %e, "Skipping local socket");
                        continue;
                    }
                    release(&created);
                    metrics::record_listener_failure(TransportKind::Socket);
                    return Err(SocketCreationError::single(TransportKind::Socket, path.clone(), e).into());
                }
            }
        }
        Ok(created)
    }

    fn create_one(&self, path: &str, mode: u32) -> io::Result<ListenerHandle> {
        if let Some(name) = path.strip_prefix('@') {
            let listener = bind_abstract(name)?;
            tracing::info!(path = %path, "Abstract socket bound");
            metrics::record_listener_created(TransportKind::Socket);
            return Ok(ListenerHandle::new(
                TransportKind::Socket,
                Endpoint::Path { path: path.to_string() },
                ListenerSocket::Unix(listener),
            ));
        }

        let std_listener = std::os::unix::net::UnixListener::bind(path)?;
        let fs_path = PathBuf::from(path);
        let inode = fs::metadata(&fs_path)?.ino();
        if let Err(e) = self.permissions.apply_socket_mode(&fs_path, mode) {
            drop(std_listener);
            remove_if_same_inode(&fs_path, inode);
            return Err(e);
        }
        self.permissions.apply_group(&fs_path);
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::info!(path = %path, mode = format!("{:o}", mode), "Local socket bound");
        metrics::record_listener_created(TransportKind::Socket);

        let handle = ListenerHandle::new(
            TransportKind::Socket,
            Endpoint::Path { path: path.to_string() },
            ListenerSocket::Unix(listener),
        );
        handle.add_cleanup(
            CleanupStage::AfterClose,
            Box::new(move || remove_if_same_inode(&fs_path, inode)),
        );
        Ok(handle)
    }
}

fn conflict(path: &str, state: SocketPathState) -> BootstrapError {
    let error = SocketConflictError {
        path: path.to_string(),
        state,
    };
    tracing::error!(path = %path, state = %state, "Socket path in use");
    error.into()
}

fn release(handles: &[ListenerHandle]) {
    for handle in handles {
        handle.cleanup();
    }
}

fn abstract_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn remove_path(path: &str) {
    match fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path, "Removed socket path"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path, error = %e, "Failed to remove socket path"),
    }
}

fn remove_stale_socket(path: &str) {
    if let Ok(meta) = fs::symlink_metadata(path) {
        if meta.file_type().is_socket() {
            remove_path(path);
        }
    }
}

/// Unlink `path` only if it is still the socket this process created.
fn remove_if_same_inode(path: &Path, inode: u64) {
    match fs::metadata(path) {
        Ok(meta) if meta.ino() == inode => match fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Socket path removed"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket path"),
        },
        Ok(_) => tracing::warn!(path = %path.display(), "Socket path was replaced, leaving it in place"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Cannot stat socket path"),
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = StdUnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "abstract sockets are not available"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::parse_bind_spec;

    fn manager(dir: &Path) -> LocalSocketManager {
        LocalSocketManager::new(
            Arc::new(RuntimeContext::detect()),
            LocalSocketConfig {
                socket_dir: dir.to_string_lossy().into_owned(),
                display_name: Some(":7".into()),
                abstract_sockets: false,
                ..LocalSocketConfig::default()
            },
            ProbeConfig {
                short_timeout_ms: 100,
                long_timeout_ms: 200,
                interval_ms: 50,
            },
        )
    }

    fn spec(path: &str) -> BindSpec {
        parse_bind_spec(TransportKind::Socket, path).unwrap()
    }

    #[test]
    fn test_resolve_paths() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let resolved = m
            .resolve_paths(&[spec("auto"), spec("named"), spec("/abs/path"), spec("none"), spec("named")])
            .unwrap();
        let paths: Vec<&str> = resolved.iter().map(|(p, _)| p.as_str()).collect();
        let base = dir.path().to_string_lossy().into_owned();
        assert_eq!(paths, vec![format!("{}/7", base).as_str(), format!("{}/named", base).as_str(), "/abs/path"]);
    }

    #[test]
    fn test_auto_needs_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path());
        m.config.display_name = None;
        assert!(matches!(
            m.resolve_paths(&[spec("auto")]),
            Err(ConfigurationError::MissingDisplayName { .. })
        ));
    }

    #[tokio::test]
    async fn test_created_socket_mode_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let handles = m.create_listeners(&[spec("sock")]).await.unwrap();
        assert_eq!(handles.len(), 1);

        let path = dir.path().join("sock");
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&meta.permissions()) & 0o777, 0o600);

        handles[0].cleanup();
        assert!(!path.exists());
        handles[0].cleanup();
    }

    #[tokio::test]
    async fn test_cleanup_leaves_replaced_path() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let handles = m.create_listeners(&[spec("sock")]).await.unwrap();

        let path = dir.path().join("sock");
        fs::remove_file(&path).unwrap();
        let _other = std::os::unix::net::UnixListener::bind(&path).unwrap();

        handles[0].cleanup();
        assert!(path.exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_abstract_socket() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let name = format!("@display-transport-test-{}", std::process::id());
        let handles = m.create_listeners(&[spec(&name)]).await.unwrap();
        assert_eq!(m.prober().probe(&name).await, SocketPathState::Live);
        handles[0].cleanup();
        assert_eq!(m.prober().probe(&name).await, SocketPathState::Dead);
    }
}
