//! Listener-side TLS: certificate loading for termination/re-encryption
//! and the ClientHello SNI peek used by passthrough routing.
//!
//! The three dispatch modes are wired in the listener: termination decrypts
//! and forwards plain HTTP, re-encryption decrypts and re-encrypts via the
//! upstream connector, and passthrough pipes bytes at L4 without
//! inspection (optionally selecting the upstream by SNI).

mod sni;

pub use sni::extract_sni;

use crate::error::ProxyError;
use std::path::Path;
use std::sync::Arc;

/// Load a rustls server config from PEM cert/key files. Minimum protocol
/// version is 1.2.
pub fn load_server_config(
    cert_file: &Path,
    key_file: &Path,
) -> Result<Arc<rustls::ServerConfig>, ProxyError> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProxyError::Configuration(format!("tls protocol setup: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Configuration(format!("invalid certificate chain: {}", e)))?;

    Ok(Arc::new(config))
}

fn load_certs(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ProxyError> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProxyError::Configuration(format!("cannot read certificate {}: {}", path.display(), e))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| {
        ProxyError::Configuration(format!("invalid certificate {}: {}", path.display(), e))
    })?;
    if certs.is_empty() {
        return Err(ProxyError::Configuration(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ProxyError> {
    let file = std::fs::File::open(path).map_err(|e| {
        ProxyError::Configuration(format!("cannot read key {}: {}", path.display(), e))
    })?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Configuration(format!("invalid key {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            ProxyError::Configuration(format!("no private key found in {}", path.display()))
        })
}
