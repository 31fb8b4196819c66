//! Certificate and key loading.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;

/// Default server certificate file name searched in the cert dirs.
pub const SERVER_CERT_FILE: &str = "ssl-cert.pem";

/// Default CA file name searched in the cert dirs.
pub const CA_CERT_FILE: &str = "ca-cert.pem";

fn read_file(path: &Path) -> Result<Vec<u8>, ConfigurationError> {
    fs::read(path).map_err(|e| ConfigurationError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// First `filename` found in `dirs`.
pub fn find_in_dirs(dirs: &[PathBuf], filename: &str) -> Option<PathBuf> {
    let found = dirs.iter().map(|dir| dir.join(filename)).find(|path| path.is_file());
    match &found {
        Some(path) => tracing::debug!(file = %filename, path = %path.display(), "Located TLS file"),
        None => tracing::debug!(file = %filename, "TLS file not found in any certificate directory"),
    }
    found
}

/// Every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let pem = read_file(path)?;
    let certs = parse_pem_certs(&pem).map_err(|reason| ConfigurationError::Unreadable {
        path: path.display().to_string(),
        reason,
    })?;
    if certs.is_empty() {
        return Err(ConfigurationError::EmptyPem {
            what: "certificate",
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

fn parse_pem_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

/// The first private key in a PEM file. Encrypted keys are refused.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigurationError> {
    let pem = read_file(path)?;
    let text = String::from_utf8_lossy(&pem);
    if text.contains("ENCRYPTED PRIVATE KEY") || text.contains("Proc-Type: 4,ENCRYPTED") {
        return Err(ConfigurationError::EncryptedKey {
            path: path.display().to_string(),
        });
    }
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
        .map_err(|e| ConfigurationError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| ConfigurationError::EmptyPem {
            what: "private key",
            path: path.display().to_string(),
        })
}

/// CA certificates from a PEM file or a directory of PEM files.
pub fn load_ca_path(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    if !path.exists() {
        return Err(ConfigurationError::MissingCaCerts(path.display().to_string()));
    }
    if !path.is_dir() {
        return load_certs(path);
    }

    let entries = fs::read_dir(path).map_err(|e| ConfigurationError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut certs = Vec::new();
    for entry in entries.flatten() {
        let file = entry.path();
        if !file.is_file() {
            continue;
        }
        match load_certs(&file) {
            Ok(mut found) => certs.append(&mut found),
            Err(e) => tracing::debug!(path = %file.display(), error = %e, "Skipping CA file"),
        }
    }
    if certs.is_empty() {
        return Err(ConfigurationError::EmptyPem {
            what: "certificate",
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

/// Decode inline CA data: `0x` hex, `b64:`/`base64:`, bare hex, bare
/// base64 or PEM text. The decoded bytes may be PEM or a single DER cert.
pub fn decode_ca_data(data: &str) -> Result<Vec<CertificateDer<'static>>, ConfigurationError> {
    let data = data.trim();
    let bytes = if data.contains("-----BEGIN") {
        data.as_bytes().to_vec()
    } else if let Some(hex_data) = data.strip_prefix("0x") {
        hex::decode(hex_data).map_err(|e| ConfigurationError::InvalidCaData(e.to_string()))?
    } else if let Some(b64) = data.strip_prefix("b64:").or_else(|| data.strip_prefix("base64:")) {
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ConfigurationError::InvalidCaData(e.to_string()))?
    } else if let Ok(bytes) = hex::decode(data) {
        bytes
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|_| ConfigurationError::InvalidCaData("not hex, base64 or PEM".to_string()))?
    };

    if bytes.starts_with(b"-----BEGIN") {
        let certs = parse_pem_certs(&bytes).map_err(ConfigurationError::InvalidCaData)?;
        if certs.is_empty() {
            return Err(ConfigurationError::InvalidCaData("no certificate in PEM data".to_string()));
        }
        Ok(certs)
    } else {
        Ok(vec![CertificateDer::from(bytes)])
    }
}

/// The bundled Mozilla root set.
pub fn default_roots() -> RootCertStore {
    RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
}

/// Build a root store, rejecting certificates that cannot be trust anchors.
pub fn roots_from(certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore, ConfigurationError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ConfigurationError::Tls("no usable CA certificate".to_string()));
    }
    if ignored > 0 {
        tracing::warn!(added, ignored, "Some CA certificates could not be used");
    }
    Ok(roots)
}

/// PEM text for one DER certificate.
pub fn pem_encode_certificate(der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// SHA-256 fingerprint, colon separated upper-case hex.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}
