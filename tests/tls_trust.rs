//! TLS handshakes and the confirm-and-retry trust workflow.

use std::time::Duration;

use display_transport::bind::{parse_bind_spec, TransportKind};
use display_transport::error::ConnectError;
use display_transport::net::ListenerFactory;
use display_transport::tls::{
    self, FailureKind, Handshake, HandshakeParams, HandshakeState, TlsContext, TlsPolicy, TlsSide,
};
use display_transport::trust::store::{CERT_FILE, OPTIONS_FILE};
use display_transport::trust::{TrustDecisionStore, TrustedConnector};
use display_transport::ConfigurationError;

mod common;

use common::{RecordingConfirm, TestCert};

const TITLE: &str = "SSL Certificate Verification Failure";

fn connector(store_dir: &std::path::Path, policy: TlsPolicy) -> TrustedConnector {
    tls::install_crypto_provider();
    TrustedConnector::new(policy, TrustDecisionStore::new(vec![store_dir.to_path_buf()]))
        .with_connect_timeout(Duration::from_secs(5))
}

fn localhost_policy() -> TlsPolicy {
    TlsPolicy::new(TlsSide::Client).with_server_hostname("localhost")
}

fn handshake_kind(err: ConnectError) -> FailureKind {
    match err {
        ConnectError::Handshake(failure) => failure.kind,
        other => panic!("expected a handshake failure, got {}", other),
    }
}

#[test]
fn test_hostname_check_requires_hostname() {
    let policy = TlsPolicy::new(TlsSide::Client);
    assert_eq!(
        tls::build_context(&policy).unwrap_err(),
        ConfigurationError::HostnameCheckWithoutHostname
    );
}

#[tokio::test]
async fn test_accepted_self_signed_certificate_is_remembered() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(true);
    let first = connector(store.path(), localhost_policy()).with_confirm(confirm.clone());
    let connection = first.connect("127.0.0.1", addr.port()).await.unwrap();
    let session = connection.tls.clone().unwrap();
    assert_eq!(session.server_hostname.as_deref(), Some("localhost"));
    assert_eq!(session.peer_certificates, 1);
    assert_eq!(
        confirm.prompts(),
        vec![(TITLE.to_string(), "Do you want to accept this certificate?".to_string())]
    );
    drop(connection);

    let host_dir = store.path().join(format!("localhost_{}", addr.port()));
    assert!(host_dir.join(CERT_FILE).exists());
    let options = std::fs::read_to_string(host_dir.join(OPTIONS_FILE)).unwrap();
    assert!(options.contains("ca-certs="));

    let silent = RecordingConfirm::new(false);
    let second = connector(store.path(), localhost_policy()).with_confirm(silent.clone());
    second.connect("127.0.0.1", addr.port()).await.unwrap();
    assert!(silent.prompts().is_empty());
}

#[tokio::test]
async fn test_declined_certificate_is_fatal_and_not_saved() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(false);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();

    assert_eq!(handshake_kind(err), FailureKind::SelfSigned);
    assert_eq!(confirm.prompts().len(), 1);
    assert!(std::fs::read_dir(store.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_expired_certificate_never_prompts() {
    let cert = TestCert::expired(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(true);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();

    assert_eq!(handshake_kind(err), FailureKind::Expired);
    assert!(confirm.prompts().is_empty());
}

#[tokio::test]
async fn test_hostname_mismatch_can_be_accepted() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let policy = TlsPolicy::new(TlsSide::Client)
        .with_server_hostname("display.example.org")
        .with_ca_certs(cert.cert_str());

    let refused = connector(store.path(), policy.clone())
        .with_confirm(RecordingConfirm::new(false))
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    assert_eq!(handshake_kind(refused), FailureKind::HostnameMismatch);

    let confirm = RecordingConfirm::new(true);
    let connection = connector(store.path(), policy)
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();
    assert!(connection.tls.is_some());
    assert_eq!(
        confirm.prompts(),
        vec![(TITLE.to_string(), "Do you want to connect anyway?".to_string())]
    );

    let options = std::fs::read_to_string(
        store
            .path()
            .join(format!("display.example.org_{}", addr.port()))
            .join(OPTIONS_FILE),
    )
    .unwrap();
    assert!(options.contains("check-hostname=false"));
}

#[tokio::test]
async fn test_ip_mismatch_is_classified() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let policy = TlsPolicy::new(TlsSide::Client).with_ca_certs(cert.cert_str());
    let err = connector(store.path(), policy.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    assert_eq!(handshake_kind(err), FailureKind::IpMismatch);

    let confirm = RecordingConfirm::new(true);
    connector(store.path(), policy)
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();
    assert_eq!(confirm.prompts().len(), 1);
}

#[tokio::test]
async fn test_unknown_issuer_is_wrong_host_and_asked_once() {
    let cert = TestCert::ca_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(true);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    assert_eq!(handshake_kind(err), FailureKind::WrongHost);
    assert_eq!(
        confirm.prompts(),
        vec![(TITLE.to_string(), "Do you want to connect anyway?".to_string())]
    );
    let options = std::fs::read_to_string(store.path().join(format!("localhost_{}", addr.port())).join(OPTIONS_FILE))
        .unwrap();
    assert!(options.contains("check-hostname=false"));

    // The saved exception already relaxes hostname checks, so there is
    // nothing left to ask.
    let again = RecordingConfirm::new(true);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(again.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    assert_eq!(handshake_kind(err), FailureKind::WrongHost);
    assert!(again.prompts().is_empty());
}

#[tokio::test]
async fn test_untrusted_root_never_prompts() {
    let cert = TestCert::with_intermediate(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(true);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    let ConnectError::Handshake(failure) = err else {
        panic!("expected a handshake failure");
    };
    assert_eq!(failure.kind, FailureKind::UntrustedRoot);
    assert_eq!(failure.verify_code, Some(19));
    assert!(confirm.prompts().is_empty());
    assert!(std::fs::read_dir(store.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_second_failure_after_accepting_is_fatal() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    // Trusting the certificate fixes the issuer, but it was never issued
    // for 127.0.0.1.
    let confirm = RecordingConfirm::new(true);
    let policy = TlsPolicy::new(TlsSide::Client).with_server_hostname("127.0.0.1");
    let err = connector(store.path(), policy)
        .with_confirm(confirm.clone())
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();

    assert_eq!(handshake_kind(err), FailureKind::IpMismatch);
    assert_eq!(
        confirm.prompts(),
        vec![(TITLE.to_string(), "Do you want to accept this certificate?".to_string())]
    );
    assert!(store
        .path()
        .join(format!("127.0.0.1_{}", addr.port()))
        .join(CERT_FILE)
        .exists());
}

#[tokio::test]
async fn test_retry_disabled_fails_without_prompt() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    let store = tempfile::tempdir().unwrap();

    let confirm = RecordingConfirm::new(true);
    let err = connector(store.path(), localhost_policy())
        .with_confirm(confirm.clone())
        .with_retry(false)
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap_err();
    assert_eq!(handshake_kind(err), FailureKind::SelfSigned);
    assert!(confirm.prompts().is_empty());
}

#[tokio::test]
async fn test_fetch_peer_certificate() {
    let cert = TestCert::self_signed(&["localhost"]);
    let addr = common::start_tls_server(&cert).await;
    tls::install_crypto_provider();

    let der = display_transport::trust::fetch_peer_certificate("127.0.0.1", addr.port(), "localhost", Duration::from_secs(2))
        .await
        .unwrap();
    let expected = tls::certs::load_certs(&cert.cert_path).unwrap();
    assert_eq!(der, expected[0]);
}

async fn ssl_listener() -> display_transport::net::ListenerHandle {
    let spec = parse_bind_spec(TransportKind::Ssl, "127.0.0.1:0").unwrap();
    let factory = ListenerFactory::new(common::test_context(), common::fast_listener_config());
    factory
        .create_batch(spec.to_requests(&common::test_context()))
        .await
        .unwrap()
        .remove(0)
}

fn server_context(cert: &TestCert) -> (TlsContext, HandshakeParams) {
    tls::install_crypto_provider();
    let policy = TlsPolicy::new(TlsSide::Server)
        .with_certificate(cert.cert_path.to_string_lossy(), cert.key_path.to_string_lossy())
        .with_verify_mode("none");
    tls::build_context(&policy).unwrap()
}

#[tokio::test]
async fn test_server_side_handshake_on_accepted_connection() {
    let cert = TestCert::self_signed(&["localhost"]);
    let (context, params) = server_context(&cert);
    let listener = ssl_listener().await;
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn({
        let listener = listener.clone();
        async move {
            let connection = listener.accept().await.unwrap();
            let peer = connection.peer.socket_addr();
            let mut handshake = Handshake::new(params, peer, Duration::from_secs(5));
            let secured = handshake.secure(&context, connection).await;
            (secured, handshake.state())
        }
    });

    let store = tempfile::tempdir().unwrap();
    let client = connector(store.path(), localhost_policy().with_ca_certs(cert.cert_str()))
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();

    let (secured, state) = server.await.unwrap();
    let secured = secured.unwrap().unwrap();
    assert_eq!(state, HandshakeState::Established);
    assert_eq!(secured.kind, TransportKind::Ssl);
    assert_eq!(secured.tls.as_ref().unwrap().server_hostname.as_deref(), Some("localhost"));
    assert_eq!(secured.tls.as_ref().unwrap().version, client.tls.as_ref().unwrap().version);
    listener.cleanup();
}

#[tokio::test]
async fn test_peer_disconnect_is_not_a_failure() {
    let cert = TestCert::self_signed(&["localhost"]);
    let (context, params) = server_context(&cert);
    let listener = ssl_listener().await;
    let addr = listener.local_addr().unwrap();

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let connection = listener.accept().await.unwrap();
    drop(stream);

    let mut handshake = Handshake::new(params, None, Duration::from_secs(5));
    let outcome = handshake.secure(&context, connection).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(handshake.state(), HandshakeState::Failed);
    listener.cleanup();
}
