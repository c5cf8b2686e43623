//! PostgreSQL man-in-the-middle session.
//!
//! One instance per forwarded SSH channel. Speaks server to the tunneled
//! client (startup, authentication, ready-for-query) and client to the
//! upstream database (mutually-authenticated TLS with a freshly issued
//! certificate), then splices the two peers: the client->server direction
//! is parsed message-by-message and checked against ABAC, the
//! server->client direction is copied as raw bytes through one reusable
//! buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::abac::{Abac, Action, Event};
use crate::buffered::{self, BufferedReader, BufferedWriter};
use crate::certissuer::CertIssuer;
use crate::error::{ProxyError, Result};
use crate::metadata::Metadata;
use crate::notifier::{Notifier, QueryMessage};
use crate::protocol::constants::*;
use crate::protocol::{
    build_auth_ok, build_backend_key_data, build_error_response, build_parameter_status,
    build_ready_for_query, parse_backend_key_data, parse_error_notice, parse_frontend_message,
    parse_parameter_status, read_message, read_startup_message, write_message, write_ssl_request,
    BackendKeyData, ErrorNoticeResponse, FrontendMessage, StartupMessage, StartupMessageType,
};
use crate::tls::TlsConnector;

/// Reusable buffer for the unparsed server->client direction.
const SERVER_BUFFER_SIZE: usize = 512 * 1024;

const DENIED_CONNECT_MESSAGE: &str = "Permission Denied";
const DENIED_QUERY_MESSAGE: &str = "Query is not permitted by administrator";

/// Shared handles every MITM session needs.
#[derive(Clone)]
pub struct MitmHandles {
    pub abac: Arc<Abac>,
    pub notifier: Notifier,
    pub cert_issuer: Arc<CertIssuer>,
    pub database_roots: Arc<RootCertStore>,
}

/// Captured result of the upstream login.
struct Upstream {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    key_data: BackendKeyData,
    parameter_statuses: HashMap<String, String>,
}

pub struct Mitm<S> {
    metadata: Metadata,
    state_id: Uuid,
    users: Vec<String>,
    /// When false (no_client_auth tunnels) any database user is allowed
    /// through to ABAC.
    check_users: bool,
    reader: BufferedReader<S>,
    writer: BufferedWriter<S>,
    server_host: String,
    server_port: u32,
    handles: MitmHandles,
}

impl<S> Mitm<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: Metadata,
        state_id: Uuid,
        users: Vec<String>,
        check_users: bool,
        channel: S,
        server_host: String,
        server_port: u32,
        handles: MitmHandles,
    ) -> Mitm<S> {
        let (reader, writer) = buffered::split(channel);
        Mitm {
            metadata,
            state_id,
            users,
            check_users,
            reader,
            writer,
            server_host,
            server_port,
            handles,
        }
    }

    /// Drive the session to completion. Returns `DisconnectUser` when
    /// policy demands the whole SSH connection be torn down; every other
    /// outcome is a clean (logged) close of this channel only.
    pub async fn proxy(mut self) -> Result<()> {
        let parameters = match self.receive_startup_message().await {
            Ok(parameters) => parameters,
            Err(ProxyError::CancelledRequest) => return Ok(()),
            Err(err) => return Err(err),
        };

        let upstream = match self.connect_to_database(&parameters).await {
            Ok(upstream) => upstream,
            Err(err @ (ProxyError::PermissionDenied | ProxyError::DisconnectUser)) => {
                self.send_client_error(DENIED_CONNECT_MESSAGE).await?;
                if matches!(err, ProxyError::DisconnectUser) {
                    return Err(ProxyError::DisconnectUser);
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.prepare_client(&upstream.key_data, &upstream.parameter_statuses)
            .await?;
        self.splice(upstream).await
    }

    /// Loop over startup-form messages until a real StartupMessage arrives.
    /// TLS and GSS encryption toward the client are refused with 'N': the
    /// transport is already inside an SSH tunnel.
    async fn receive_startup_message(&mut self) -> Result<HashMap<String, String>> {
        loop {
            match read_startup_message(&mut self.reader).await? {
                StartupMessageType::Startup(StartupMessage { parameters, .. }) => {
                    self.handles.notifier.on_query_message(
                        QueryMessage::Startup {
                            parameters: parameters.clone(),
                        },
                        self.metadata.snapshot(),
                    );
                    return Ok(parameters);
                }
                StartupMessageType::SslRequest => {
                    self.handles
                        .notifier
                        .on_query_message(QueryMessage::SslRequest, self.metadata.snapshot());
                    self.writer.write_all(&[NOT_SUPPORTED_BYTE]).await?;
                    self.writer.flush().await?;
                }
                StartupMessageType::GssEncRequest => {
                    self.handles
                        .notifier
                        .on_query_message(QueryMessage::GssEncRequest, self.metadata.snapshot());
                    self.writer.write_all(&[NOT_SUPPORTED_BYTE]).await?;
                    self.writer.flush().await?;
                }
                StartupMessageType::CancelRequest(cancel) => {
                    self.handles.notifier.on_query_message(
                        QueryMessage::CancelRequest {
                            process_id: cancel.process_id,
                            secret_key: cancel.secret_key,
                        },
                        self.metadata.snapshot(),
                    );
                    return Err(ProxyError::CancelledRequest);
                }
            }
        }
    }

    /// Authorize the requested user, consult ABAC, then log in to the
    /// upstream database over mutual TLS with a one-minute certificate.
    async fn connect_to_database(
        &mut self,
        parameters: &HashMap<String, String>,
    ) -> Result<Upstream> {
        let user = parameters
            .get("user")
            .ok_or_else(|| ProxyError::Protocol("user not found in startup parameters".into()))?
            .clone();
        let database = parameters
            .get("database")
            .ok_or_else(|| ProxyError::Protocol("database not found in startup parameters".into()))?
            .clone();

        let auth_error = if self.check_users && !self.users.iter().any(|u| u == &user) {
            Some(format!("forbidden username: {user}"))
        } else {
            None
        };
        self.handles
            .notifier
            .on_database_auth(auth_error.clone(), self.metadata.snapshot());
        if auth_error.is_some() {
            return Err(ProxyError::PermissionDenied);
        }

        self.observe_connection(&user, &database)?;

        self.metadata.database_name = database;
        self.metadata.database_username = user.clone();

        let issuer = Arc::clone(&self.handles.cert_issuer);
        let subject = user.clone();
        let issued = tokio::task::spawn_blocking(move || issuer.issue(&subject))
            .await
            .map_err(|err| ProxyError::CertIssue(format!("issue task: {err}")))??;

        let port = u16::try_from(self.server_port)
            .map_err(|_| ProxyError::Protocol(format!("invalid target port: {}", self.server_port)))?;
        let mut tcp = TcpStream::connect((self.server_host.as_str(), port)).await?;

        // sslmode=verify-full: request SSL, then handshake against the
        // database CA pool with SNI set to the target host.
        write_ssl_request(&mut tcp).await?;
        let mut response = [0u8; 1];
        tcp.read_exact(&mut response).await?;
        if response[0] != b'S' {
            return Err(ProxyError::Protocol(format!(
                "server refused SSL (answered 0x{:02x})",
                response[0]
            )));
        }

        let connector = TlsConnector::with_client_cert(
            &self.handles.database_roots,
            vec![issued.cert_der.clone()],
            issued.key_der.clone(),
        )?;
        let mut stream = connector.connect(tcp, &self.server_host).await?;

        let startup = StartupMessage::new(parameters.clone());
        crate::protocol::write_startup_message(&mut stream, &startup).await?;

        let mut key_data = BackendKeyData::default();
        let mut parameter_statuses = HashMap::new();
        loop {
            let (msg_type, payload) = read_message(&mut stream).await?;
            match msg_type {
                MSG_AUTH_REQUEST => {
                    if payload.len() < 4 {
                        return Err(ProxyError::Protocol("authentication message too short".into()));
                    }
                    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    if code != AUTH_OK {
                        return Err(ProxyError::Protocol(format!(
                            "unsupported authentication request {code}; certificate login expected"
                        )));
                    }
                }
                MSG_BACKEND_KEY_DATA => {
                    key_data = parse_backend_key_data(&payload)?;
                }
                MSG_PARAMETER_STATUS => {
                    let status = parse_parameter_status(&payload)?;
                    parameter_statuses.insert(status.name, status.value);
                }
                MSG_READY_FOR_QUERY => break,
                MSG_ERROR_RESPONSE => {
                    let response = parse_error_notice(&payload).unwrap_or_default();
                    return Err(ProxyError::Connection(format!(
                        "database refused connection: {}",
                        response.message().unwrap_or("unknown error")
                    )));
                }
                MSG_NOTICE_RESPONSE => {
                    debug!("notice from server during startup");
                }
                other => {
                    warn!("unexpected message during startup: type {}", other as char);
                }
            }
        }

        Ok(Upstream {
            stream,
            key_data,
            parameter_statuses,
        })
    }

    /// ABAC gate on (database, user). Disconnect outranks NotPermit.
    fn observe_connection(&self, user: &str, database: &str) -> Result<()> {
        let observed = self.handles.abac.observe(
            &self.state_id,
            [
                Event::DatabaseName(database.to_string()),
                Event::DatabaseUsername(user.to_string()),
            ],
        );
        let (actions, rules) = match observed {
            Ok(result) => result,
            Err(err) => {
                error!("failed to observe state {}: {err}", self.state_id);
                return Ok(());
            }
        };

        let notifier = &self.handles.notifier;
        if actions.contains(Action::NOTIFY) {
            notifier.on_notify(
                &format!("user {user} connecting to {database}"),
                rules.clone(),
                self.metadata.snapshot(),
            );
        }
        if actions.contains(Action::DISCONNECT) {
            if actions.contains(Action::NOTIFY) {
                notifier.on_notify(
                    &format!("user {user} was not permitted to connect to {database} and disconnected"),
                    rules,
                    self.metadata.snapshot(),
                );
            }
            return Err(ProxyError::DisconnectUser);
        }
        if actions.contains(Action::NOT_PERMIT) {
            if actions.contains(Action::NOTIFY) {
                notifier.on_notify(
                    &format!("user {user} was not permitted to connect to {database}"),
                    rules,
                    self.metadata.snapshot(),
                );
            }
            return Err(ProxyError::PermissionDenied);
        }
        Ok(())
    }

    /// Complete the client's handshake: it now believes it authenticated
    /// against the real server.
    async fn prepare_client(
        &mut self,
        key_data: &BackendKeyData,
        parameters: &HashMap<String, String>,
    ) -> Result<()> {
        write_message(&mut self.writer, MSG_AUTH_REQUEST, &build_auth_ok()).await?;
        write_message(
            &mut self.writer,
            MSG_BACKEND_KEY_DATA,
            &build_backend_key_data(key_data),
        )
        .await?;
        for (name, value) in parameters {
            write_message(
                &mut self.writer,
                MSG_PARAMETER_STATUS,
                &build_parameter_status(name, value),
            )
            .await?;
        }
        write_message(
            &mut self.writer,
            MSG_READY_FOR_QUERY,
            &build_ready_for_query(TX_STATUS_IDLE),
        )
        .await?;
        Ok(())
    }

    async fn send_client_error(&mut self, message: &str) -> Result<()> {
        let response = ErrorNoticeResponse::error("ERROR", "403", message);
        write_message(
            &mut self.writer,
            MSG_ERROR_RESPONSE,
            &build_error_response(&response),
        )
        .await?;
        Ok(())
    }

    /// Run the two splice directions until either side finishes; tear both
    /// down together.
    async fn splice(self, upstream: Upstream) -> Result<()> {
        let half_closed = Arc::new(AtomicBool::new(false));
        let policy = QueryPolicy {
            abac: Arc::clone(&self.handles.abac),
            notifier: self.handles.notifier.clone(),
            metadata: self.metadata.clone(),
            state_id: self.state_id,
        };

        let (server_reader, server_writer) = tokio::io::split(upstream.stream);
        let client_writer = Arc::new(Mutex::new(self.writer));

        let mut c2s = tokio::spawn(client_to_server(
            self.reader,
            server_writer,
            Arc::clone(&client_writer),
            policy,
            Arc::clone(&half_closed),
        ));
        let mut s2c = tokio::spawn(server_to_client(
            server_reader,
            client_writer,
            Arc::clone(&half_closed),
        ));

        let (c2s_result, s2c_result) = tokio::select! {
            result = &mut c2s => {
                s2c.abort();
                (result.ok(), s2c.await.ok())
            }
            result = &mut s2c => {
                c2s.abort();
                (c2s.await.ok(), result.ok())
            }
        };

        if let Some(Err(err)) = s2c_result {
            error!("proxy server to client: {err}");
        }
        match c2s_result {
            Some(Err(ProxyError::DisconnectUser)) => Err(ProxyError::DisconnectUser),
            Some(Err(err)) => {
                error!("proxy client to server: {err}");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Context for per-query policy decisions during the splice.
#[derive(Clone)]
struct QueryPolicy {
    abac: Arc<Abac>,
    notifier: Notifier,
    metadata: Metadata,
    state_id: Uuid,
}

impl QueryPolicy {
    /// Evaluate one intercepted SQL string against a throwaway clone of the
    /// connection state. Parse failures log and let the query through.
    fn on_query(&self, query: &str) -> Result<()> {
        let statements = match crate::sql::extract_query_statements(query) {
            Ok(statements) => statements,
            Err(err) => {
                error!("extract query statements: {err}");
                return Ok(());
            }
        };

        let scratch = self.abac.new_state_from(&self.state_id, None);
        let observed = self
            .abac
            .observe(&scratch, [Event::QueryStatements(statements.clone())]);
        self.abac.delete_state(&scratch);

        let (actions, rules) = match observed {
            Ok(result) => result,
            Err(err) => {
                error!("observe query statements: {err}");
                return Ok(());
            }
        };
        if actions.is_empty() {
            return Ok(());
        }

        let mut data = self.metadata.snapshot();
        data.query = query.to_string();
        data.query_statements.extend(statements);

        if actions.contains(Action::NOTIFY) {
            self.notifier
                .on_notify("query statements observed", rules.clone(), data.clone());
        }
        if actions.contains(Action::DISCONNECT) {
            if actions.contains(Action::NOTIFY) {
                self.notifier.on_notify(
                    "user was disconnected from database because of the query",
                    rules,
                    data,
                );
            }
            return Err(ProxyError::DisconnectUser);
        }
        if actions.contains(Action::NOT_PERMIT) {
            if actions.contains(Action::NOTIFY) {
                self.notifier.on_notify("query was not permitted", rules, data);
            }
            return Err(ProxyError::PermissionDenied);
        }
        Ok(())
    }
}

/// Parse each frontend message, consult policy where it carries SQL, and
/// forward. Returns `DisconnectUser` when policy tears the session down.
async fn client_to_server<R, W, CW>(
    mut client_reader: R,
    mut server_writer: W,
    client_writer: Arc<Mutex<CW>>,
    policy: QueryPolicy,
    half_closed: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    CW: AsyncWrite + Unpin,
{
    loop {
        let (msg_type, payload) = match read_message(&mut client_reader).await {
            Ok(message) => message,
            Err(ProxyError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                half_closed.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(err) => {
                half_closed.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };

        let message = parse_frontend_message(msg_type, &payload)?;
        let verdict = match &message {
            FrontendMessage::Query { query } => {
                policy.notifier.on_query_message(
                    QueryMessage::Query {
                        query: query.clone(),
                    },
                    policy.metadata.snapshot(),
                );
                policy.on_query(query)
            }
            FrontendMessage::Parse { name, query } => {
                policy.notifier.on_query_message(
                    QueryMessage::Parse {
                        name: name.clone(),
                        query: query.clone(),
                    },
                    policy.metadata.snapshot(),
                );
                policy.on_query(query)
            }
            FrontendMessage::Bind => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Bind, policy.metadata.snapshot());
                Ok(())
            }
            FrontendMessage::Execute => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Execute, policy.metadata.snapshot());
                Ok(())
            }
            FrontendMessage::Describe => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Describe, policy.metadata.snapshot());
                Ok(())
            }
            FrontendMessage::Sync => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Sync, policy.metadata.snapshot());
                Ok(())
            }
            FrontendMessage::Close => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Close, policy.metadata.snapshot());
                Ok(())
            }
            FrontendMessage::Terminate => {
                policy
                    .notifier
                    .on_query_message(QueryMessage::Terminate, policy.metadata.snapshot());
                half_closed.store(true, Ordering::SeqCst);
                write_message(&mut server_writer, MSG_TERMINATE, &[]).await?;
                return Ok(());
            }
            FrontendMessage::Other(msg_type) => {
                debug!("forwarding unhandled frontend message type {}", *msg_type as char);
                Ok(())
            }
        };

        match verdict {
            Ok(()) => {
                write_message(&mut server_writer, msg_type, &payload).await?;
            }
            Err(ProxyError::PermissionDenied) => {
                let response = ErrorNoticeResponse::error("ERROR", "403", DENIED_QUERY_MESSAGE);
                let mut writer = client_writer.lock().await;
                write_message(
                    &mut *writer,
                    MSG_ERROR_RESPONSE,
                    &build_error_response(&response),
                )
                .await?;
                write_message(
                    &mut *writer,
                    MSG_READY_FOR_QUERY,
                    &build_ready_for_query(TX_STATUS_IDLE),
                )
                .await?;
            }
            Err(ProxyError::DisconnectUser) => {
                half_closed.store(true, Ordering::SeqCst);
                write_message(&mut server_writer, MSG_TERMINATE, &[]).await?;
                let response = ErrorNoticeResponse::error("ERROR", "403", DENIED_QUERY_MESSAGE);
                let mut writer = client_writer.lock().await;
                write_message(
                    &mut *writer,
                    MSG_ERROR_RESPONSE,
                    &build_error_response(&response),
                )
                .await?;
                return Err(ProxyError::DisconnectUser);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Copy raw server bytes to the client through one reusable buffer,
/// without parsing result-set traffic.
async fn server_to_client<R, W>(
    mut server_reader: R,
    client_writer: Arc<Mutex<W>>,
    half_closed: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; SERVER_BUFFER_SIZE];
    loop {
        let n = match server_reader.read(&mut buffer).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::UnexpectedEof
                    && half_closed.load(Ordering::SeqCst)
                {
                    return Ok(());
                }
                return Err(err.into());
            }
        };
        trace!("copying {n} server bytes to client");
        let mut writer = client_writer.lock().await;
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
    }
}
