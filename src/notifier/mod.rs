//! Event sink and out-of-band delivery endpoint.
//!
//! Producers post typed events into a bounded queue; posting never blocks
//! the data path (a full queue drops the event with an error log). A
//! mutual-TLS HTTPS endpoint drains the queue: `GET /?count=N` returns up
//! to N events as a JSON array.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::NotifierConfig;
use crate::error::{ProxyError, Result};
use crate::metadata::Metadata;
use crate::tls::TlsAcceptor;

const DEFAULT_COUNT: usize = 100;

/// Summary of one intercepted protocol message, attached to
/// `query-message` events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueryMessage {
    Startup { parameters: HashMap<String, String> },
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: u32, secret_key: u32 },
    Query { query: String },
    Parse { name: String, query: String },
    Bind,
    Execute,
    Describe,
    Sync,
    Close,
    Terminate,
}

/// Typed notification records drained by the out-of-band endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    ConnectionAccept {
        connection_id: String,
        local_address: String,
        remote_address: String,
    },
    AuthCertificate {
        key_id: String,
        valid_after: DateTime<Utc>,
        valid_before: DateTime<Utc>,
    },
    AbacRule {
        time: DateTime<Utc>,
        message: String,
        matched_rules: Vec<String>,
        metadata: Metadata,
    },
    DatabaseUsers {
        users: Vec<String>,
        metadata: Metadata,
    },
    DirectTcpipRequest {
        metadata: Metadata,
    },
    QueryMessage {
        message: QueryMessage,
        metadata: Metadata,
    },
    DatabaseAuth {
        authentication_error: Option<String>,
        metadata: Metadata,
    },
    ConnectionClosed {
        error: Option<String>,
        metadata: Metadata,
    },
}

/// Shared handle to the drained end of the queue.
pub type EventQueue = Arc<Mutex<mpsc::Receiver<Event>>>;

/// Non-blocking producer handle. Cloned into every connection and channel
/// task; a disabled notifier swallows events silently.
#[derive(Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::Sender<Event>>,
}

impl Notifier {
    /// Build a producer plus the queue its server side drains.
    pub fn bounded(capacity: usize) -> (Notifier, EventQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Notifier { tx: Some(tx) }, Arc::new(Mutex::new(rx)))
    }

    /// A producer that drops everything (notifier disabled).
    pub fn disabled() -> Notifier {
        Notifier { tx: None }
    }

    fn post(&self, event: Event) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.try_send(event) {
            error!("failed to queue event: {err}");
        }
    }

    pub fn on_connection_accept(&self, connection_id: &str, local: &str, remote: &str) {
        self.post(Event::ConnectionAccept {
            connection_id: connection_id.to_string(),
            local_address: local.to_string(),
            remote_address: remote.to_string(),
        });
    }

    pub fn on_auth_certificate(
        &self,
        key_id: &str,
        valid_after: DateTime<Utc>,
        valid_before: DateTime<Utc>,
    ) {
        self.post(Event::AuthCertificate {
            key_id: key_id.to_string(),
            valid_after,
            valid_before,
        });
    }

    pub fn on_notify(&self, message: &str, matched_rules: Vec<String>, metadata: Metadata) {
        self.post(Event::AbacRule {
            time: Utc::now(),
            message: message.to_string(),
            matched_rules,
            metadata,
        });
    }

    pub fn on_database_users(&self, users: Vec<String>, metadata: Metadata) {
        self.post(Event::DatabaseUsers { users, metadata });
    }

    pub fn on_direct_tcpip_request(&self, metadata: Metadata) {
        self.post(Event::DirectTcpipRequest { metadata });
    }

    pub fn on_query_message(&self, message: QueryMessage, metadata: Metadata) {
        self.post(Event::QueryMessage { message, metadata });
    }

    pub fn on_database_auth(&self, error: Option<String>, metadata: Metadata) {
        self.post(Event::DatabaseAuth {
            authentication_error: error,
            metadata,
        });
    }

    pub fn on_connection_closed(&self, error: Option<String>, metadata: Metadata) {
        self.post(Event::ConnectionClosed { error, metadata });
    }
}

/// HTTPS endpoint draining the event queue.
pub struct NotifierServer {
    config: NotifierConfig,
    queue: EventQueue,
}

impl NotifierServer {
    pub fn new(config: NotifierConfig, queue: EventQueue) -> NotifierServer {
        NotifierServer { config, queue }
    }

    pub fn router(queue: EventQueue) -> Router {
        Router::new().route("/", get(drain_events)).with_state(queue)
    }

    /// Serve until cancellation. TLS (when enabled) requires a client
    /// certificate signed by the configured client CA.
    pub async fn serve(self, token: CancellationToken) -> Result<()> {
        let acceptor = if self.config.tls.enabled {
            let tls = &self.config.tls;
            let cert = tls
                .cert_path
                .as_ref()
                .ok_or_else(|| ProxyError::Config("notifier tls requires cert_path".into()))?;
            let key = tls
                .key_path
                .as_ref()
                .ok_or_else(|| ProxyError::Config("notifier tls requires key_path".into()))?;
            let client_ca = tls
                .client_ca_path
                .as_ref()
                .ok_or_else(|| ProxyError::Config("notifier tls requires client_ca_path".into()))?;
            Some(TlsAcceptor::with_client_verification(cert, key, client_ca)?)
        } else {
            None
        };

        let app = Self::router(self.queue.clone());
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!(
            "notifier listening on {}:{} (tls: {})",
            self.config.host,
            self.config.port,
            acceptor.is_some()
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        if token.is_cancelled() {
                            break;
                        }
                        error!("notifier accept: {err}");
                        continue;
                    }
                },
            };

            let app = app.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let service = TowerToHyperService::new(app);
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            ConnBuilder::new(TokioExecutor::new())
                                .serve_connection(TokioIo::new(tls_stream), service)
                                .await
                        }
                        Err(err) => {
                            info!("notifier TLS handshake with {peer}: {err}");
                            return;
                        }
                    },
                    None => {
                        ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                    }
                };
                if let Err(err) = result {
                    debug!("notifier connection {peer}: {err}");
                }
            });
        }
        Ok(())
    }
}

async fn drain_events(
    State(queue): State<EventQueue>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let count = match params.get("count") {
        None => DEFAULT_COUNT,
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) if n <= 0 => DEFAULT_COUNT,
            Ok(n) => n as usize,
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid count").into_response(),
        },
    };

    let mut events = Vec::with_capacity(count.min(DEFAULT_COUNT));
    {
        let mut rx = queue.lock().await;
        for _ in 0..count {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
    }

    match serde_json::to_vec(&events) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("marshal events: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
