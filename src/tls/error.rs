//! TLS error type shared by the connector and acceptor.

use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate file could not be read or parsed
    #[error("Failed to load certificate from {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    /// Private key file could not be read or parsed
    #[error("Failed to load private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Invalid TLS configuration
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// TLS handshake failure
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

impl TlsError {
    pub fn cert_load(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        TlsError::CertificateLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn key_load(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        TlsError::KeyLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        TlsError::Config(reason.into())
    }

    pub fn handshake(reason: impl Into<String>) -> Self {
        TlsError::Handshake(reason.into())
    }
}
