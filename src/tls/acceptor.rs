//! TLS acceptor for the notifier's event-drain endpoint.
//!
//! The endpoint is mutual-TLS only: clients must present a certificate
//! signed by the configured client CA.

use std::path::Path;
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;

use super::{load_certificates, load_private_key, load_root_store, TlsError};

/// Server-side TLS acceptor requiring verified client certificates.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    pub fn with_client_verification(
        cert_path: &Path,
        key_path: &Path,
        client_ca_path: &Path,
    ) -> Result<Self, TlsError> {
        let certs = load_certificates(cert_path)?;
        if certs.is_empty() {
            return Err(TlsError::cert_load(cert_path, "no certificates found in file"));
        }
        let key = load_private_key(key_path)?;

        let roots = load_root_store(client_ca_path)?;
        if roots.is_empty() {
            return Err(TlsError::cert_load(client_ca_path, "no CA certificates found"));
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::config(format!("Failed to build client verifier: {e}")))?;

        let provider = rustls::crypto::ring::default_provider();
        let config = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::config(format!("Failed to set protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::config(format!("Failed to build server TLS config: {e}")))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept<S>(&self, stream: S) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::handshake(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn acceptor_nonexistent_cert_file() {
        let result = TlsAcceptor::with_client_verification(
            &PathBuf::from("/nonexistent/cert.pem"),
            &PathBuf::from("/nonexistent/key.pem"),
            &PathBuf::from("/nonexistent/ca.pem"),
        );
        assert!(result.is_err());
    }
}
