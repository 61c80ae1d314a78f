//! TLS termination for the client-facing listener.
//!
//! Loads a PEM certificate chain and private key into a
//! `rustls::ServerConfig` shared by every accepted connection.

use pki_types::CertificateDer;
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{ProxyError, Result};

/// Loads a TLS `ServerConfig` from the given certificate and key paths.
///
/// The key may be PKCS#8, PKCS#1 or SEC1; the first one found is used.
pub fn load_tls_config(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Arc<ServerConfig>> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<std::result::Result<_, _>>()?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        ProxyError::Certificate(format!("no private key found in {}", key_path.display()))
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // The listener only speaks HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
