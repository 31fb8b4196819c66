//! Persistent per-endpoint trust decisions.
//!
//! Layout under each hosts directory:
//!
//! ```text
//! <hosts_dir>/<sanitized-host>_<port>/options   key=value TLS attributes
//! <hosts_dir>/<sanitized-host>_<port>/cert.pem  accepted peer certificate
//! ```
//!
//! Port `0` names a host-wide entry used when no port-specific one exists.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::config::{expand_user, TrustConfig};

/// Attribute keys accepted in an `options` file.
pub const TRUST_ATTRIBUTES: [&str; 12] = [
    "cert",
    "key",
    "ca-certs",
    "ca-data",
    "protocol",
    "client-verify-mode",
    "server-verify-mode",
    "verify-flags",
    "check-hostname",
    "server-hostname",
    "options",
    "ciphers",
];

pub const OPTIONS_FILE: &str = "options";
pub const CERT_FILE: &str = "cert.pem";

const STORE_DIR_MODE: u32 = 0o700;

/// Remembered TLS attribute overrides for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustException {
    pub hostname: String,
    pub port: u16,
    pub attributes: BTreeMap<String, String>,
}

impl TrustException {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone)]
pub struct TrustDecisionStore {
    dirs: Vec<PathBuf>,
}

impl TrustDecisionStore {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn from_config(config: &TrustConfig) -> Self {
        Self::new(config.hosts_dirs.iter().map(|dir| expand_user(dir)).collect())
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Directory name for an endpoint: the hostname reduced to
    /// alphanumerics and `-.:#_`, suffixed with `_<port>` unless port is 0.
    pub fn host_dir_name(hostname: &str, port: u16) -> String {
        let mut name: String = hostname
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || "-.:#_".contains(*c))
            .collect();
        if port != 0 {
            name.push_str(&format!("_{}", port));
        }
        name
    }

    fn host_dirs(&self, hostname: &str, port: u16) -> impl Iterator<Item = PathBuf> + '_ {
        let name = Self::host_dir_name(hostname, port);
        self.dirs.iter().map(move |dir| dir.join(&name))
    }

    /// Locate `filename` for the endpoint, falling back to the port-0 entry.
    pub fn find_file(&self, hostname: &str, port: u16, filename: &str) -> Option<PathBuf> {
        let find = |port| self.host_dirs(hostname, port).map(|d| d.join(filename)).find(|f| f.exists());
        find(port).or_else(|| if port != 0 { find(0) } else { None })
    }

    /// Stored attributes for the endpoint; empty when nothing is remembered.
    pub fn load(&self, hostname: &str, port: u16) -> TrustException {
        let mut exception = TrustException::new(hostname, port);
        let Some(path) = self.find_file(hostname, port, OPTIONS_FILE) else {
            return exception;
        };
        match fs::read_to_string(&path) {
            Ok(text) => exception.attributes = parse_options_file(&text, &path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to read trust options"),
        }
        tracing::debug!(
            hostname,
            port,
            path = %path.display(),
            attributes = ?exception.attributes,
            "Loaded trust options"
        );
        exception
    }

    /// Write the exception's attributes to the endpoint's `options` file.
    pub fn save(&self, exception: &TrustException) -> io::Result<PathBuf> {
        let mut text = String::new();
        for (key, value) in &exception.attributes {
            text.push_str(&format!("{}={}\n", key.replace('_', "-"), value));
        }
        self.save_file(&exception.hostname, exception.port, OPTIONS_FILE, text.as_bytes())
    }

    /// Write `data` into the endpoint directory, preferring one that already
    /// exists, otherwise creating it in the first usable hosts directory.
    pub fn save_file(&self, hostname: &str, port: u16, filename: &str, data: &[u8]) -> io::Result<PathBuf> {
        let mut last_error = None;
        for dir in self.host_dirs(hostname, port).filter(|d| d.is_dir()) {
            match write_file(&dir.join(filename), data) {
                Ok(path) => return Ok(path),
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "Cannot write to trust directory");
                    last_error = Some(e);
                }
            }
        }
        for dir in self.host_dirs(hostname, port) {
            let created = fs::DirBuilder::new()
                .recursive(true)
                .mode(STORE_DIR_MODE)
                .create(&dir)
                .and_then(|_| write_file(&dir.join(filename), data));
            match created {
                Ok(path) => return Ok(path),
                Err(e) => {
                    tracing::debug!(dir = %dir.display(), error = %e, "Cannot create trust directory");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no trust directory configured")))
    }
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<PathBuf> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    tracing::info!(path = %path.display(), "Saved trust decision");
    Ok(path.to_path_buf())
}

/// Parse `key=value` lines, skipping blanks, comments and unknown keys.
pub fn parse_options_file(text: &str, source: &Path) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !TRUST_ATTRIBUTES.contains(&key) {
            tracing::warn!(key, path = %source.display(), "Unknown TLS attribute in trust options");
            continue;
        }
        attributes.insert(key.to_string(), value.to_string());
    }
    attributes
}
