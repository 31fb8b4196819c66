//! Server certificate verifiers.
//!
//! `PolicyServerVerifier` wraps the webpki verifier and refines its errors:
//! an unknown issuer is reported with a verify code saying whether the peer
//! is self-signed, presented an untrusted chain, or a lone certificate.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, OtherError, RootCertStore, SignatureScheme};

use crate::tls::handshake::{VERIFY_SELF_SIGNED, VERIFY_UNTRUSTED_ROOT, VERIFY_WRONG_HOST};

/// A verification failure carrying an X.509 style verify code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyCodeError {
    pub code: i32,
    pub reason: &'static str,
}

impl fmt::Display for VerifyCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (verify code {})", self.reason, self.code)
    }
}

impl StdError for VerifyCodeError {}

fn verify_code_error(code: i32, reason: &'static str) -> Error {
    Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(VerifyCodeError {
        code,
        reason,
    }))))
}

pub(crate) fn is_name_mismatch(error: &Error) -> bool {
    matches!(
        error,
        Error::InvalidCertificate(CertificateError::NotValidForName)
            | Error::InvalidCertificate(CertificateError::NotValidForNameContext { .. })
    )
}

/// webpki verification with optional hostname checking and refined
/// unknown-issuer errors.
#[derive(Debug)]
pub struct PolicyServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    check_hostname: bool,
}

impl PolicyServerVerifier {
    pub fn new(roots: RootCertStore, provider: Arc<CryptoProvider>, check_hostname: bool) -> Result<Self, Error> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .map_err(|e| Error::General(e.to_string()))?;
        Ok(Self {
            inner,
            provider,
            check_hostname,
        })
    }

    fn classify_unknown_issuer(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        now: UnixTime,
    ) -> Error {
        if !intermediates.is_empty() {
            return verify_code_error(VERIFY_UNTRUSTED_ROOT, "certificate chain ends in an untrusted root");
        }

        let mut roots = RootCertStore::empty();
        if roots.add(end_entity.clone().into_owned()).is_err() {
            return verify_code_error(VERIFY_WRONG_HOST, "unable to get local issuer certificate");
        }
        let verifier = match WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&self.provider)).build() {
            Ok(verifier) => verifier,
            Err(_) => return verify_code_error(VERIFY_WRONG_HOST, "unable to get local issuer certificate"),
        };
        match verifier.verify_server_cert(end_entity, &[], server_name, &[], now) {
            Ok(_) => verify_code_error(VERIFY_SELF_SIGNED, "self-signed certificate"),
            Err(e) if is_name_mismatch(&e) => verify_code_error(VERIFY_SELF_SIGNED, "self-signed certificate"),
            Err(e @ Error::InvalidCertificate(CertificateError::Expired))
            | Err(e @ Error::InvalidCertificate(CertificateError::ExpiredContext { .. })) => e,
            Err(_) => verify_code_error(VERIFY_WRONG_HOST, "unable to get local issuer certificate"),
        }
    }
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(e) if !self.check_hostname && is_name_mismatch(&e) => {
                tracing::debug!(server_name = ?server_name, "Ignoring hostname mismatch");
                Ok(ServerCertVerified::assertion())
            }
            Err(Error::InvalidCertificate(CertificateError::UnknownIssuer)) => {
                Err(self.classify_unknown_issuer(end_entity, intermediates, server_name, now))
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any server certificate, still checking handshake signatures.
/// Used for verify mode `none` and for fetching a peer certificate.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn code_of(error: &Error) -> Option<i32> {
        match error {
            Error::InvalidCertificate(CertificateError::Other(other)) => {
                other.0.downcast_ref::<VerifyCodeError>().map(|e| e.code)
            }
            _ => None,
        }
    }

    #[test]
    fn test_self_signed_is_recognised() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let verifier = PolicyServerVerifier::new(crate::tls::certs::default_roots(), provider(), true).unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        let err = verifier
            .verify_server_cert(certified.cert.der(), &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert_eq!(code_of(&err), Some(VERIFY_SELF_SIGNED));
    }

    #[test]
    fn test_hostname_check_can_be_disabled() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let name = ServerName::try_from("other.example").unwrap();

        let strict = PolicyServerVerifier::new(roots.clone(), provider(), true).unwrap();
        let err = strict
            .verify_server_cert(certified.cert.der(), &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(is_name_mismatch(&err));

        let relaxed = PolicyServerVerifier::new(roots, provider(), false).unwrap();
        assert!(relaxed
            .verify_server_cert(certified.cert.der(), &[], &name, &[], UnixTime::now())
            .is_ok());
    }
}
