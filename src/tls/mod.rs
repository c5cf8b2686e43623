//! TLS plumbing shared by the MITM upstream connector and the notifier's
//! HTTPS endpoint. Built on rustls with the ring provider; certificates and
//! keys are loaded from PEM files.

mod acceptor;
mod connector;
mod error;

pub use acceptor::TlsAcceptor;
pub use connector::{database_root_store, TlsConnector};
pub use error::TlsError;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;

/// Load all certificates from a PEM file (supports chains).
pub(crate) fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    Ok(certs)
}

/// Load the first private key from a PEM file (PKCS#8, PKCS#1 or SEC1).
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::key_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::key_load(path, e.to_string()))?
        .ok_or_else(|| TlsError::key_load(path, "no private key found in file"))
}

/// Build a root store from a CA bundle file.
pub(crate) fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    for cert in load_certificates(path)? {
        store
            .add(cert)
            .map_err(|e| TlsError::cert_load(path, e.to_string()))?;
    }
    Ok(store)
}
