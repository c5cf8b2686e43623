//! Error types for db-proxy

use thiserror::Error;

use crate::tls::TlsError;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SSH admission error (bad certificate, non-certificate key)
    #[error("Auth error: {0}")]
    Auth(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Certificate issuance failure
    #[error("Certificate issue error: {0}")]
    CertIssue(String),

    /// ABAC observation against a state that does not exist
    #[error("unknown state")]
    UnknownState,

    /// Policy verdict: reject the current operation, keep the session
    #[error("user permission denied")]
    PermissionDenied,

    /// Policy verdict: tear the whole SSH session down
    #[error("disconnect user")]
    DisconnectUser,

    /// Client sent a CancelRequest instead of a startup message
    #[error("cancelled request")]
    CancelledRequest,
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
