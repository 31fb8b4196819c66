//! Socket and socket-directory permissions.
//!
//! # Responsibilities
//! - Compute the mode of created sockets
//! - Create socket directories with the right mode and group
//! - Hand shared sockets to the trust group when allowed

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bind::{is_true, BindOptions};
use crate::config::LocalSocketConfig;
use crate::context::RuntimeContext;
use crate::error::ConfigurationError;

/// Mode of sockets shared with the shared-memory group.
pub const SHARED_MEMORY_SOCKET_MODE: u32 = 0o660;

/// Mode of private socket directories.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Per-socket option requesting the shared-memory group mode.
pub const MMAP_GROUP_OPTION: &str = "mmap-group";

/// Parse an octal permission string such as `600` or `0o660`.
pub fn parse_socket_mode(value: &str) -> Result<u32, ConfigurationError> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    let mode = u32::from_str_radix(digits, 8).map_err(|e| ConfigurationError::InvalidPermissions {
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if mode > 0o777 {
        return Err(ConfigurationError::InvalidPermissions {
            value: value.to_string(),
            reason: "must be between 0 and 777".to_string(),
        });
    }
    Ok(mode)
}

/// Applies socket modes, directory modes and group ownership.
#[derive(Debug, Clone)]
pub struct PermissionManager {
    ctx: Arc<RuntimeContext>,
    config: LocalSocketConfig,
}

impl PermissionManager {
    pub fn new(ctx: Arc<RuntimeContext>, config: LocalSocketConfig) -> Self {
        Self { ctx, config }
    }

    /// Mode for a socket created with `options`.
    pub fn socket_mode(&self, options: &BindOptions) -> Result<u32, ConfigurationError> {
        let shared = self.config.mmap_group || options.get(MMAP_GROUP_OPTION).map(|v| is_true(v)).unwrap_or(false);
        if shared {
            return Ok(SHARED_MEMORY_SOCKET_MODE);
        }
        parse_socket_mode(&self.config.socket_permissions)
    }

    /// The trust group id, when this process may assign it.
    pub fn trust_group_id(&self) -> Option<u32> {
        let gid = self.ctx.group_id(&self.config.trust_group)?;
        if self.ctx.may_use_group(gid) {
            Some(gid)
        } else {
            None
        }
    }

    /// System-wide directories shared between users.
    pub fn is_shared_dir(&self, dir: &Path) -> bool {
        self.config.shared_dirs.iter().any(|shared| dir.starts_with(shared))
    }

    fn expected_dir_mode(&self, dir: &Path) -> u32 {
        if self.is_shared_dir(dir) {
            self.config.shared_dir_mode
        } else {
            PRIVATE_DIR_MODE
        }
    }

    /// Create `dir` (and parents) if missing. Existing directories are
    /// left alone; a mode other than the expected one is only reported.
    pub fn ensure_socket_dir(&self, dir: &Path) -> io::Result<()> {
        let expected = self.expected_dir_mode(dir);

        match fs::symlink_metadata(dir) {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("socket directory {} is a symlink", dir.display()),
                    ));
                }
                if !meta.is_dir() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a directory", dir.display()),
                    ));
                }
                let mode = meta.permissions().mode() & 0o777;
                if mode != expected && !self.mode_mismatch_expected(dir, mode) {
                    tracing::warn!(
                        dir = %dir.display(),
                        mode = format!("{:o}", mode),
                        expected = format!("{:o}", expected),
                        "Socket directory has unexpected permissions"
                    );
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new().recursive(true).mode(expected).create(dir)?;
                fs::set_permissions(dir, fs::Permissions::from_mode(expected))?;
                if self.is_shared_dir(dir) {
                    self.apply_group(dir);
                }
                tracing::info!(dir = %dir.display(), mode = format!("{:o}", expected), "Created socket directory");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn mode_mismatch_expected(&self, dir: &Path, mode: u32) -> bool {
        if dir == Path::new("/tmp") {
            return true;
        }
        if self.is_shared_dir(dir) && mode == 0o750 {
            return true;
        }
        match std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from) {
            Some(runtime) if dir.starts_with(&runtime) => fs::metadata(&runtime)
                .map(|meta| meta.permissions().mode() & 0o777 == PRIVATE_DIR_MODE)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn apply_socket_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    /// Give `path` to the trust group. Never fails the caller.
    pub fn apply_group(&self, path: &Path) {
        let Some(gid) = self.trust_group_id() else {
            return;
        };
        match std::os::unix::fs::lchown(path, None, Some(gid)) {
            Ok(()) => tracing::debug!(path = %path.display(), gid, "Assigned trust group"),
            Err(e) => tracing::warn!(
                path = %path.display(),
                group = %self.config.trust_group,
                error = %e,
                "Failed to assign socket group"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: LocalSocketConfig) -> PermissionManager {
        PermissionManager::new(Arc::new(RuntimeContext::detect()), config)
    }

    #[test]
    fn test_parse_socket_mode() {
        assert_eq!(parse_socket_mode("600").unwrap(), 0o600);
        assert_eq!(parse_socket_mode("0o660").unwrap(), 0o660);
        assert_eq!(parse_socket_mode("0777").unwrap(), 0o777);
        assert!(parse_socket_mode("1000").is_err());
        assert!(parse_socket_mode("689").is_err());
        assert!(parse_socket_mode("").is_err());
    }

    #[test]
    fn test_shared_memory_mode_wins() {
        let pm = manager(LocalSocketConfig::default());
        let mut options = BindOptions::new();
        assert_eq!(pm.socket_mode(&options).unwrap(), 0o600);
        options.insert(MMAP_GROUP_OPTION.into(), "yes".into());
        assert_eq!(pm.socket_mode(&options).unwrap(), 0o660);

        let pm = manager(LocalSocketConfig {
            mmap_group: true,
            socket_permissions: "bogus".into(),
            ..LocalSocketConfig::default()
        });
        assert_eq!(pm.socket_mode(&BindOptions::new()).unwrap(), 0o660);
    }

    #[test]
    fn test_private_dir_is_created_0700() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("a").join("b");
        let pm = manager(LocalSocketConfig::default());
        pm.ensure_socket_dir(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);

        // existing directories are not modified
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755)).unwrap();
        pm.ensure_socket_dir(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_shared_dir_mode() {
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("shared");
        let pm = manager(LocalSocketConfig {
            shared_dirs: vec![shared.to_string_lossy().into_owned()],
            trust_group: "no-such-group-for-tests".into(),
            ..LocalSocketConfig::default()
        });
        pm.ensure_socket_dir(&shared).unwrap();
        let mode = fs::metadata(&shared).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o775);
        assert!(pm.trust_group_id().is_none());
    }

    #[test]
    fn test_symlinked_dir_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("target");
        fs::create_dir(&target).unwrap();
        let link = root.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let pm = manager(LocalSocketConfig::default());
        assert!(pm.ensure_socket_dir(&link).is_err());
    }
}
