//! TLS connector for the upstream database leg.
//!
//! The MITM dials the database with the equivalent of `sslmode=verify-full`:
//! the configured database CA is the only trust root, the hostname is
//! checked via SNI, and the freshly issued client certificate authenticates
//! the proxy as the database user.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;

use super::{load_root_store, TlsError};

/// Client-side TLS connector with mandatory server verification.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector that trusts only `roots` and presents the given
    /// client certificate and PKCS#8 key during the handshake.
    pub fn with_client_cert(
        roots: &RootCertStore,
        cert_chain: Vec<CertificateDer<'static>>,
        key_pkcs8: Vec<u8>,
    ) -> Result<Self, TlsError> {
        let provider = rustls::crypto::ring::default_provider();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pkcs8));

        let config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {e}")))?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| TlsError::config(format!("Failed to build client TLS config: {e}")))?;

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    /// Connect over any async stream, verifying the peer as `server_name`.
    pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::config(format!("Invalid server name: {server_name}")))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

/// Load the database CA trust pool used for every upstream connection.
pub fn database_root_store(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let store = load_root_store(ca_path)?;
    if store.is_empty() {
        return Err(TlsError::cert_load(ca_path, "no CA certificates found"));
    }
    Ok(store)
}
