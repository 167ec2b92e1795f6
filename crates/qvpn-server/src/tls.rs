//! TLS material loading and peer identity extraction.
//!
//! The server presents the configured certificate, requires a client
//! certificate chain rooted in the configured CA, and derives the peer
//! identity from the validated client certificate's subject Common Name.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use x509_parser::prelude::*;

use qvpn_core::constants::ALPN;
use qvpn_core::error::{Error, Result};
use qvpn_core::PeerId;

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| Error::Config {
        message: format!("cannot read {}: {}", path.display(), e),
    })?;

    let mut certs = Vec::new();
    let mut reader = std::io::BufReader::new(&pem[..]);
    for cert in rustls_pemfile::certs(&mut reader) {
        certs.push(cert.map_err(|e| Error::Config {
            message: format!("invalid certificate in {}: {}", path.display(), e),
        })?);
    }

    if certs.is_empty() {
        return Err(Error::Config {
            message: format!("no certificates found in {}", path.display()),
        });
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).map_err(|e| Error::Config {
        message: format!("cannot read {}: {}", path.display(), e),
    })?;

    let mut reader = std::io::BufReader::new(&pem[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config {
            message: format!("invalid private key in {}: {}", path.display(), e),
        })?
        .ok_or_else(|| Error::Config {
            message: format!("no private key found in {}", path.display()),
        })
}

/// Build a root store from the CA bundle used to verify client
/// certificates.
pub fn load_client_ca(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| Error::Config {
            message: format!("invalid CA certificate in {}: {}", path.display(), e),
        })?;
    }
    Ok(roots)
}

/// Assemble the rustls server configuration: server identity from
/// `cert_file`/`key_file`, mandatory client certificates verified against
/// `ca_file`, HTTP/3 ALPN.
pub fn server_tls_config(
    cert_file: &Path,
    key_file: &Path,
    ca_file: &Path,
) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let roots = load_client_ca(ca_file)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Config {
            message: format!("client certificate verifier: {e}"),
        })?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config {
            message: format!("server TLS identity: {e}"),
        })?;
    config.alpn_protocols = vec![ALPN.to_vec()];

    Ok(config)
}

/// Extract the peer identity from a validated client certificate (DER).
///
/// The subject Common Name becomes the [`PeerId`]; a certificate without
/// one is rejected.
pub fn peer_common_name(cert_der: &[u8]) -> Result<PeerId> {
    let (_, cert) = X509Certificate::from_der(cert_der).map_err(|e| Error::PeerRejected {
        message: format!("unparsable client certificate: {e}"),
    })?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| Error::PeerRejected {
            message: "client certificate has no subject CN".to_string(),
        })?;

    if cn.is_empty() {
        return Err(Error::PeerRejected {
            message: "client certificate subject CN is empty".to_string(),
        });
    }
    Ok(PeerId::new(cn))
}
