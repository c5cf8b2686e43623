//! db-proxy - SSH-tunneled PostgreSQL interception proxy
//!
//! This library provides the core of a transparent database proxy that:
//! - Terminates SSH tunnels with certificate-based admission
//! - Terminates the PostgreSQL protocol on both sides of every forwarded
//!   channel, logging in upstream with short-lived client certificates
//! - Extracts structured operations from intercepted SQL
//! - Enforces attribute-based access-control rules with live reload
//! - Posts typed events into a bounded queue drained over mutual TLS

#[macro_use]
mod logging;

pub mod abac;
pub mod buffered;
pub mod certissuer;
pub mod config;
pub mod error;
pub mod metadata;
pub mod mitm;
pub mod notifier;
pub mod protocol;
pub mod sql;
pub mod tls;
pub mod tunnel;

pub use abac::{Abac, Action};
pub use certissuer::CertIssuer;
pub use config::Config;
pub use error::{ProxyError, Result};
pub use metadata::Metadata;
pub use mitm::{Mitm, MitmHandles};
pub use notifier::{Notifier, NotifierServer};
pub use sql::{extract_query_statements, QueryStatement, StatementKind};
pub use tunnel::Tunnel;
