//! TLS listener setup
//!
//! Loads the server certificate chain and private key from PEM files and
//! builds the acceptor the WebSocket listener wraps inbound streams with.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Error type for TLS listener configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    Certificate(String),
    /// Private key error
    PrivateKey(String),
    /// TLS configuration error
    Config(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::Certificate(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "Private key error: {}", msg),
            TlsError::Config(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {}", e)))
}

/// Build a TLS acceptor from PEM certificate and key files.
pub fn load_tls_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_private_key(key_path.as_ref())?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to build TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
