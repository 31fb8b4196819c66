//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use display_transport::config::{ListenerConfig, ProbeConfig};
use display_transport::tls::{self, TlsContext, TlsPolicy, TlsSide};
use display_transport::trust::Confirm;
use display_transport::RuntimeContext;

/// IPv4-only context so tests behave the same on every host.
pub fn test_context() -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext {
        ipv6: false,
        dualstack_ipv6: false,
        uid: 1000,
        privileged: false,
        group_ids: vec![1000],
        vsock: false,
    })
}

pub fn fast_listener_config() -> ListenerConfig {
    ListenerConfig {
        min_port: 0,
        retry_attempts: 1,
        retry_pause_ms: 50,
    }
}

pub fn fast_probe_config(long_timeout_ms: u64) -> ProbeConfig {
    ProbeConfig {
        short_timeout_ms: 100,
        long_timeout_ms,
        interval_ms: 50,
    }
}

/// A certificate and key written to a temporary directory.
pub struct TestCert {
    pub dir: tempfile::TempDir,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCert {
    /// Self-signed certificate for `names`.
    pub fn self_signed(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names).unwrap();
        Self::write(certified.cert.pem(), certified.key_pair.serialize_pem())
    }

    /// Self-signed certificate whose validity ended long ago.
    pub fn expired(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = rcgen::CertificateParams::new(names).unwrap();
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self::write(cert.pem(), key.serialize_pem())
    }

    /// Leaf for `names` signed by a throwaway CA nobody trusts. Only the
    /// leaf is served.
    pub fn ca_signed(names: &[&str]) -> Self {
        let (ca, ca_key) = authority("Display Transport Test CA", None);
        let (leaf, leaf_key) = leaf(names, &ca, &ca_key);
        Self::write(leaf.pem(), leaf_key.serialize_pem())
    }

    /// Leaf served together with its intermediate; the root is untrusted.
    pub fn with_intermediate(names: &[&str]) -> Self {
        let (root, root_key) = authority("Display Transport Test Root", None);
        let (intermediate, intermediate_key) =
            authority("Display Transport Test Intermediate", Some((&root, &root_key)));
        let (leaf, leaf_key) = leaf(names, &intermediate, &intermediate_key);
        Self::write(format!("{}{}", leaf.pem(), intermediate.pem()), leaf_key.serialize_pem())
    }

    fn write(cert_pem: String, key_pem: String) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert_pem).unwrap();
        fs::write(&key_path, key_pem).unwrap();
        Self {
            dir,
            cert_path,
            key_path,
        }
    }

    pub fn cert_str(&self) -> String {
        self.cert_path.to_string_lossy().into_owned()
    }
}

fn authority(
    name: &str,
    issuer: Option<(&rcgen::Certificate, &rcgen::KeyPair)>,
) -> (rcgen::Certificate, rcgen::KeyPair) {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, name);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = match issuer {
        Some((issuer, issuer_key)) => params.signed_by(&key, issuer, issuer_key).unwrap(),
        None => params.self_signed(&key).unwrap(),
    };
    (cert, key)
}

fn leaf(names: &[&str], issuer: &rcgen::Certificate, issuer_key: &rcgen::KeyPair) -> (rcgen::Certificate, rcgen::KeyPair) {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let mut params = rcgen::CertificateParams::new(names.clone()).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, names.first().cloned().unwrap_or_default());
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, issuer, issuer_key).unwrap();
    (cert, key)
}

/// Start a TLS server presenting `cert`. Each connection is held open
/// until the client closes it.
pub async fn start_tls_server(cert: &TestCert) -> SocketAddr {
    tls::install_crypto_provider();
    let policy = TlsPolicy::new(TlsSide::Server)
        .with_certificate(cert.cert_path.to_string_lossy(), cert.key_path.to_string_lossy())
        .with_verify_mode("none");
    let (context, _) = tls::build_context(&policy).unwrap();
    let TlsContext::Server(acceptor) = context else {
        panic!("expected a server context");
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut stream) = acceptor.accept(socket).await {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                }
            });
        }
    });
    addr
}

/// Confirm implementation that answers a fixed value and records prompts.
#[derive(Clone)]
pub struct RecordingConfirm {
    answer: bool,
    prompts: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingConfirm {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `(title, prompt)` of every question asked so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Confirm for RecordingConfirm {
    fn confirm(&self, _message: &str, title: &str, prompt: &str) -> bool {
        self.prompts.lock().unwrap().push((title.to_string(), prompt.to_string()));
        self.answer
    }
}

/// Create a socket file with no listener behind it.
pub fn stale_socket(path: &Path) {
    let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
    drop(listener);
}
