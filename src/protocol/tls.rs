//! TLS Contexts
//!
//! Builds rustls configurations for mutually-authenticated connections. Both
//! sides present certificates issued by the cluster certificate authority;
//! issuance itself is an external collaborator, this module only loads the
//! PEM material it produced.

use crate::config::TlsConfig;
use crate::error::ProtocolError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProtocolError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::TlsSetup(format!("bad certificate file {:?}: {}", path, e)))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProtocolError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProtocolError::TlsSetup(format!("bad key file {:?}: {}", path, e)))?
        .ok_or_else(|| ProtocolError::TlsSetup(format!("no private key in {:?}", path)))
}

fn ca_roots(tls: &TlsConfig) -> Result<RootCertStore, ProtocolError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&tls.ca_certificate)? {
        roots
            .add(cert)
            .map_err(|e| ProtocolError::TlsSetup(format!("bad CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Acceptor for the control service: requires a client certificate signed by
/// the cluster CA.
pub fn acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, ProtocolError> {
    let roots = ca_roots(tls)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ProtocolError::TlsSetup(format!("client verifier: {}", e)))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&tls.certificate)?, load_key(&tls.key)?)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for an agent: verifies the service against the cluster CA and
/// presents its own certificate for client authentication.
pub fn connector(tls: &TlsConfig) -> Result<TlsConnector, ProtocolError> {
    let roots = ca_roots(tls)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&tls.certificate)?, load_key(&tls.key)?)?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse the server name an agent dials by.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProtocolError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProtocolError::TlsSetup(format!("bad server name '{}': {}", host, e)))
}
