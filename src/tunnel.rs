//! SSH tunnel listener.
//!
//! Accepts TCP connections, runs the SSH server handshake with
//! certificate-only public-key authentication against the configured user
//! CA, and fans every accepted `direct-tcpip` channel out to a PostgreSQL
//! MITM session. ABAC gates admission before the handshake and can tear a
//! live connection down when the rule set is hot-reloaded.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use russh::keys::{Certificate, PublicKey};
use russh::server::{Auth, Config as SshServerConfig, Handler, Msg, Session};
use russh::Channel;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::abac::{Abac, Action, Event};
use crate::certissuer::CertIssuer;
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::metadata::Metadata;
use crate::mitm::{Mitm, MitmHandles};
use crate::notifier::Notifier;
use crate::tls::database_root_store;

/// Shared pieces cloned into every accepted connection.
#[derive(Clone)]
struct ConnContext {
    config: Arc<Config>,
    ssh_config: Arc<SshServerConfig>,
    user_ca: Option<Arc<PublicKey>>,
    handles: MitmHandles,
}

/// The SSH tunnel listener.
pub struct Tunnel {
    context: ConnContext,
}

impl Tunnel {
    pub fn new(config: Arc<Config>, abac: Arc<Abac>, notifier: Notifier) -> Result<Tunnel> {
        let cert_issuer = Arc::new(CertIssuer::new(
            &config.mitm.client_ca_path,
            &config.mitm.client_private_key_path,
        )?);
        let database_roots = Arc::new(database_root_store(&config.mitm.database_ca_path)?);

        let host_key = russh::keys::load_secret_key(&config.host_key_path, None)
            .map_err(|e| ProxyError::Config(format!("load host key: {e}")))?;

        let user_ca = if config.no_client_auth {
            None
        } else {
            let path = config
                .user_ca_path
                .as_ref()
                .ok_or_else(|| ProxyError::Config("user_ca_path is required".into()))?;
            let contents = std::fs::read_to_string(path)?;
            Some(Arc::new(parse_user_ca(&contents)?))
        };

        let ssh_config = Arc::new(SshServerConfig {
            keys: vec![host_key],
            ..Default::default()
        });

        Ok(Tunnel {
            context: ConnContext {
                config,
                ssh_config,
                user_ca,
                handles: MitmHandles {
                    abac,
                    notifier,
                    cert_issuer,
                    database_roots,
                },
            },
        })
    }

    /// Accept loop; runs until the token is cancelled. Connections already
    /// accepted continue until their peers close or policy disconnects them.
    pub async fn serve(&self, token: CancellationToken) -> Result<()> {
        let config = &self.context.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        info!("tunnel listening on {}:{}", config.host, config.port);

        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        if token.is_cancelled() {
                            break;
                        }
                        error!("accept: {err}");
                        break;
                    }
                },
            };
            let context = self.context.clone();
            tokio::spawn(async move {
                handle_connection(context, stream, peer).await;
            });
        }
        Ok(())
    }
}

async fn handle_connection(context: ConnContext, stream: TcpStream, peer: SocketAddr) {
    let connection_id = Uuid::new_v4().to_string();
    info!("accepted connection {connection_id} from {peer}");

    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let state_id = context.handles.abac.new_state(Some(reload_tx));
    let metadata = Metadata {
        connection_id: connection_id.clone(),
        state_id: state_id.to_string(),
        remote_addr: peer.to_string(),
        ..Metadata::default()
    };

    // Admission: evaluate source address and time before any handshake work.
    match context.handles.abac.observe(
        &state_id,
        [Event::Ip(peer.to_string()), Event::Time(Utc::now())],
    ) {
        Ok((actions, rules)) => {
            if actions.contains(Action::NOTIFY) {
                context
                    .handles
                    .notifier
                    .on_notify("got-connection", rules.clone(), metadata.snapshot());
            }
            if actions.intersects(Action::NOT_PERMIT | Action::DISCONNECT) {
                if actions.contains(Action::NOTIFY) {
                    context.handles.notifier.on_notify(
                        "not-permitted-connection",
                        rules,
                        metadata.snapshot(),
                    );
                }
                info!("connection {connection_id} not permitted");
                context.handles.abac.delete_state(&state_id);
                return;
            }
        }
        Err(err) => error!("failed to observe state {state_id}: {err}"),
    }

    let local = stream
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    context
        .handles
        .notifier
        .on_connection_accept(&connection_id, &local, &peer.to_string());

    let conn_token = CancellationToken::new();

    // Reload watcher: when the rule set is replaced, re-evaluate this
    // connection's accumulated state and cut the session on Disconnect.
    {
        let abac = Arc::clone(&context.handles.abac);
        let watcher_token = conn_token.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                match abac.observe(&state_id, []) {
                    Ok((actions, _)) if actions.contains(Action::DISCONNECT) => {
                        info!("disconnecting state {state_id} after rule reload");
                        watcher_token.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    }

    let handler = ClientHandler {
        config: Arc::clone(&context.config),
        user_ca: context.user_ca.clone(),
        handles: context.handles.clone(),
        metadata: metadata.clone(),
        state_id,
        conn_token: conn_token.clone(),
        users: Vec::new(),
        users_announced: false,
    };

    let result = run_session(
        Arc::clone(&context.ssh_config),
        stream,
        handler,
        conn_token,
    )
    .await;

    let error = match &result {
        Ok(()) => None,
        Err(err) => {
            let text = err.to_string();
            if is_benign_close(&text) {
                None
            } else {
                Some(text)
            }
        }
    };
    match &result {
        Ok(()) => info!("closed connection {connection_id}"),
        Err(err @ ProxyError::Auth(_)) => info!("connection {connection_id}: {err}"),
        Err(err) => error!("connection {connection_id}: {err}"),
    }
    context
        .handles
        .notifier
        .on_connection_closed(error, metadata.snapshot());
    context.handles.abac.delete_state(&state_id);
}

/// Run one SSH session to completion, or drop it when the connection token
/// fires (policy disconnect), which closes the underlying TCP stream.
async fn run_session(
    config: Arc<SshServerConfig>,
    stream: TcpStream,
    handler: ClientHandler,
    token: CancellationToken,
) -> Result<()> {
    let session = russh::server::run_stream(config, stream, handler).await?;
    tokio::select! {
        result = session => result,
        _ = token.cancelled() => Ok(()),
    }
}

struct ClientHandler {
    config: Arc<Config>,
    user_ca: Option<Arc<PublicKey>>,
    handles: MitmHandles,
    metadata: Metadata,
    state_id: Uuid,
    conn_token: CancellationToken,
    /// Principals of the authenticated certificate; the MITM authorizes the
    /// requested database user against this list.
    users: Vec<String>,
    users_announced: bool,
}

impl Handler for ClientHandler {
    type Error = ProxyError;

    async fn auth_none(&mut self, _user: &str) -> std::result::Result<Auth, Self::Error> {
        if self.config.no_client_auth {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::UnsupportedMethod)
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        if self.config.no_client_auth {
            return Ok(Auth::Accept);
        }
        // Only SSH certificates are admitted.
        Err(ProxyError::Auth("received non-certificate key".into()))
    }

    async fn auth_openssh_certificate(
        &mut self,
        _user: &str,
        certificate: &Certificate,
    ) -> std::result::Result<Auth, Self::Error> {
        let Some(user_ca) = self.user_ca.clone() else {
            return Ok(Auth::Accept);
        };

        info!(
            "tries to auth: key-id {:?}, valid-after {}, valid-before {}",
            certificate.key_id(),
            certificate.valid_after(),
            certificate.valid_before(),
        );
        self.handles.notifier.on_auth_certificate(
            certificate.key_id(),
            unix_time(certificate.valid_after()),
            unix_time(certificate.valid_before()),
        );

        let principals =
            validate_certificate(certificate, &user_ca, Utc::now().timestamp() as u64)?;
        self.users = principals;
        if !self.users_announced {
            self.users_announced = true;
            self.handles
                .notifier
                .on_database_users(self.users.clone(), self.metadata.snapshot());
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        // Only direct-tcpip forwarding is served.
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let mut metadata = self.metadata.clone();
        metadata.request_id = Uuid::new_v4().to_string();
        info!(
            "accepted new request {} ({originator_address}:{originator_port} -> {host_to_connect}:{port_to_connect})",
            metadata.request_id
        );
        self.handles
            .notifier
            .on_direct_tcpip_request(metadata.snapshot());

        let mitm = Mitm::new(
            metadata.clone(),
            self.state_id,
            self.users.clone(),
            !self.config.no_client_auth,
            channel.into_stream(),
            host_to_connect.to_string(),
            port_to_connect,
            self.handles.clone(),
        );
        let token = self.conn_token.clone();
        let request_id = metadata.request_id;
        tokio::spawn(async move {
            match mitm.proxy().await {
                Ok(()) => info!("finished request {request_id}"),
                Err(ProxyError::DisconnectUser) => {
                    info!("request {request_id} disconnected the user");
                    token.cancel();
                }
                Err(err) => error!("handle channel {request_id}: {err}"),
            }
        });
        Ok(true)
    }
}

/// Validate an OpenSSH certificate against the user CA: validity window,
/// constant-time signature-key equality, at least one principal. Returns
/// the principal list.
fn validate_certificate(
    certificate: &Certificate,
    user_ca: &PublicKey,
    now: u64,
) -> Result<Vec<String>> {
    if certificate.valid_after() > now {
        return Err(ProxyError::Auth("certificate is not active".into()));
    }
    if certificate.valid_before() < now {
        return Err(ProxyError::Auth("certificate has expired".into()));
    }

    // Compare bare key material; any comment on the CA line is irrelevant.
    let presented = encode_key(PublicKey::from(certificate.signature_key().clone()))?;
    let expected = encode_key(PublicKey::from(user_ca.key_data().clone()))?;
    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(ProxyError::Auth("invalid signature".into()));
    }

    let principals = certificate.valid_principals();
    if principals.is_empty() {
        return Err(ProxyError::Auth("no valid principals".into()));
    }
    Ok(principals.to_vec())
}

fn encode_key(key: PublicKey) -> Result<String> {
    key.to_openssh()
        .map_err(|e| ProxyError::Auth(format!("encode public key: {e}")))
}

/// Parse the first key token of an authorized-keys style CA file.
fn parse_user_ca(contents: &str) -> Result<PublicKey> {
    let line = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| ProxyError::Config("user CA file contains no keys".into()))?;
    PublicKey::from_openssh(line)
        .map_err(|e| ProxyError::Config(format!("parse user CA: {e}")))
}

fn unix_time(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Errors raised by tearing down a connection we closed ourselves.
fn is_benign_close(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("closed") || lower.contains("disconnect") || lower.contains("eof")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use ssh_key::certificate::{Builder as CertBuilder, CertType};
    use ssh_key::{Algorithm, PrivateKey};

    fn keypair() -> PrivateKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("generate key")
    }

    fn build_cert(
        ca: &PrivateKey,
        subject: &PrivateKey,
        principals: &[&str],
        valid_after: u64,
        valid_before: u64,
    ) -> Certificate {
        let mut builder = CertBuilder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            valid_after,
            valid_before,
        )
        .expect("builder");
        builder.cert_type(CertType::User).expect("cert type");
        builder.key_id("test-cert").expect("key id");
        for principal in principals {
            builder.valid_principal(*principal).expect("principal");
        }
        builder.sign(ca).expect("sign")
    }

    #[test]
    fn valid_certificate_yields_principals() {
        let ca = keypair();
        let subject = keypair();
        let now = Utc::now().timestamp() as u64;
        let cert = build_cert(&ca, &subject, &["alice", "bob"], now - 60, now + 3600);

        let principals = validate_certificate(&cert, ca.public_key(), now).expect("validate");
        assert_eq!(principals, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn not_yet_active_certificate_rejected() {
        let ca = keypair();
        let subject = keypair();
        let now = Utc::now().timestamp() as u64;
        let cert = build_cert(&ca, &subject, &["alice"], now + 600, now + 3600);

        let err = validate_certificate(&cert, ca.public_key(), now).unwrap_err();
        assert!(err.to_string().contains("not active"));
    }

    #[test]
    fn expired_certificate_rejected() {
        let ca = keypair();
        let subject = keypair();
        let now = Utc::now().timestamp() as u64;
        let cert = build_cert(&ca, &subject, &["alice"], now - 3600, now - 60);

        let err = validate_certificate(&cert, ca.public_key(), now).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn certificate_from_other_ca_rejected() {
        let ca = keypair();
        let other_ca = keypair();
        let subject = keypair();
        let now = Utc::now().timestamp() as u64;
        let cert = build_cert(&other_ca, &subject, &["alice"], now - 60, now + 3600);

        let err = validate_certificate(&cert, ca.public_key(), now).unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[test]
    fn certificate_without_principals_rejected() {
        let ca = keypair();
        let subject = keypair();
        let now = Utc::now().timestamp() as u64;
        let cert = build_cert(&ca, &subject, &[], now - 60, now + 3600);

        let err = validate_certificate(&cert, ca.public_key(), now).unwrap_err();
        assert!(err.to_string().contains("no valid principals"));
    }

    #[test]
    fn parse_user_ca_takes_first_key() {
        let key = keypair();
        let encoded = key.public_key().to_openssh().expect("encode");
        let contents = format!("# user CA\n\n{encoded}\nssh-ed25519 AAAA garbage\n");

        let parsed = parse_user_ca(&contents).expect("parse");
        assert_eq!(
            parsed.to_openssh().expect("encode"),
            key.public_key().to_openssh().expect("encode")
        );
    }

    #[test]
    fn parse_user_ca_empty_file() {
        assert!(parse_user_ca("# nothing here\n").is_err());
    }
}
