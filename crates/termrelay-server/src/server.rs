//! Core server: accepts connections and drives each one through
//! negotiation, relaying and teardown.
//!
//! Owns the record store, the authenticator and the negotiator. Every
//! connection runs in its own task; shutdown is broadcast to all of them so
//! active sessions close through the normal teardown path.

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::relay::{FileTransferAdapter, RelayEngine};
use crate::session::{generate_session_id, AuditSubject, SessionLifecycle};
use crate::ssh::{spawn_shell_worker, Negotiator, SftpFiles};
use crate::store::{AuditJournal, MemoryStore, RecordStore};
use crate::transport::{websocket, PendingConnection, UpgradeRequest};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termrelay_core::{generate_secret, CredentialCipher, Geometry, RelayError, RelayResult};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Path clients connect to.
const WS_PATH: &str = "/ws";

/// How long active sessions get to tear down after shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators shared by every connection task.
struct Shared {
    config: ServerConfig,
    store: Arc<dyn RecordStore>,
    auth: Arc<dyn Authenticator>,
    negotiator: Negotiator,
}

/// The termrelay server instance.
pub struct RelayServer {
    shared: Arc<Shared>,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Build the server from configuration: open the audit journal, seed
    /// the host records and set up token verification.
    pub async fn new(config: ServerConfig) -> RelayResult<Self> {
        let store = match &config.journal_path {
            Some(path) => {
                info!(path = %path.display(), "audit journal enabled");
                MemoryStore::with_journal(AuditJournal::new(path.clone())).await?
            }
            None => MemoryStore::new(),
        };
        let store: Arc<dyn RecordStore> = Arc::new(store);

        for entry in &config.hosts {
            let host = store.create_host_record(entry.clone().into()).await?;
            debug!(host_id = host.id, host = %host.external_ip, "registered host");
        }
        info!(count = config.hosts.len(), "host records loaded");

        let secret = match &config.token_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("security.token_secret is not set; generated an ephemeral secret, issued tokens will not verify");
                generate_secret()?
            }
        };
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(secret));

        Self::with_parts(config, store, auth)
    }

    /// Build the server around an existing store and authenticator.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        auth: Arc<dyn Authenticator>,
    ) -> RelayResult<Self> {
        let cipher = Arc::new(CredentialCipher::new(config.require_credential_key()?)?);
        let negotiator = Negotiator::new(
            config.ssh.clone(),
            cipher,
            store.clone(),
            config.unit_proxy_ip.clone(),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                auth,
                negotiator,
            }),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    /// Listen on the configured address until `shutdown` completes.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> RelayResult<()> {
        let addr: SocketAddr = self
            .shared
            .config
            .listen_addr()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid listen address: {e}")))?;
        let (_, connections) = websocket::start_listener(addr).await?;
        self.serve(connections, shutdown).await;
        Ok(())
    }

    /// Accept connections from `connections` until `shutdown` completes,
    /// then tear down every active session.
    pub async fn serve(
        self,
        mut connections: mpsc::Receiver<PendingConnection>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                conn = connections.recv() => match conn {
                    Some(conn) => {
                        let shared = self.shared.clone();
                        let shutdown_rx = self.shutdown_tx.subscribe();
                        sessions.spawn(handle_connection(shared, conn, shutdown_rx));
                    }
                    None => {
                        warn!("listener stopped");
                        break;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "session task panicked");
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        let _ = self.shutdown_tx.send(());
        if !sessions.is_empty() {
            info!(active = sessions.len(), "closing active sessions");
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "sessions did not close in time, aborting");
            sessions.shutdown().await;
        }
    }
}

/// Drive one connection from upgrade request to closed session.
async fn handle_connection(
    shared: Arc<Shared>,
    conn: PendingConnection,
    shutdown: broadcast::Receiver<()>,
) {
    let session_id = generate_session_id();
    let remote = conn.remote_addr;

    let request = match UpgradeRequest::read(conn).await {
        Ok(request) => request,
        Err(e) => {
            debug!(remote = %remote, error = %e, "invalid upgrade request");
            return;
        }
    };

    if request.path() != WS_PATH {
        request.reject(404, "Not Found", "unknown path").await;
        return;
    }

    let host_id = match parse_host_id(request.query_param("host_id").as_deref()) {
        Ok(id) => id,
        Err(e) => {
            request.reject(400, "Bad Request", &e.to_string()).await;
            return;
        }
    };

    let token = request.query_param("token").unwrap_or_default();
    let username = match shared.auth.verify(&token).await {
        Ok(username) => username,
        Err(e) => {
            warn!(remote = %remote, error = %e, "authentication failed");
            request.reject(401, "Unauthorized", "invalid token").await;
            return;
        }
    };

    info!(session_id = %session_id, remote = %remote, user = %username, host_id, "negotiating session");

    let negotiated = match shared.negotiator.negotiate(host_id, &session_id).await {
        Ok(negotiated) => negotiated,
        Err(e) => {
            let (status, reason) = rejection_for(&e);
            warn!(session_id = %session_id, host_id, error = %e, kind = e.kind(), "negotiation failed");
            request.reject(status, reason, &e.to_string()).await;
            return;
        }
    };

    let transport = negotiated.transport.clone();
    let mut lifecycle = SessionLifecycle::new(&session_id, shared.store.clone());
    if let Err(e) = lifecycle.connected(transport.clone()) {
        error!(session_id = %session_id, error = %e, "lifecycle rejected transport");
        request.reject(500, "Internal Server Error", "session setup failed").await;
        lifecycle.close(&[]).await;
        return;
    }

    let link = match request.accept(shared.config.max_frame_size).await {
        Ok(link) => link,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "client handshake failed");
            lifecycle.close(&[]).await;
            return;
        }
    };

    let subject = AuditSubject {
        username,
        ssh_host: negotiated.host.external_ip.clone(),
        ssh_user: negotiated.host.login_user.clone(),
        proxy_host: negotiated
            .proxy
            .as_ref()
            .map(|proxy| proxy.external_ip.clone())
            .unwrap_or_default(),
    };

    let shell = spawn_shell_worker(session_id.clone(), negotiated.channel);
    let transfers = FileTransferAdapter::new(
        SftpFiles::new(&session_id, transport),
        shared.config.staging_dir.clone(),
        shared.config.upload_dir.clone(),
    );
    let geometry = Geometry::new(shared.config.ssh.cols, shared.config.ssh.rows);
    let mut engine = RelayEngine::new(&session_id, link, shell, transfers, geometry);

    if let Err(e) = lifecycle.begin_relaying(&subject).await {
        error!(session_id = %session_id, host = %subject.ssh_host, error = %e, kind = e.kind(), "failed to open audit record");
        engine.shutdown().await;
        lifecycle.close(&[]).await;
        return;
    }

    let reason = engine.run(&negotiated.banner, shutdown).await;
    info!(
        session_id = %session_id,
        host = %subject.ssh_host,
        audit_id = ?lifecycle.audit_id(),
        reason = ?reason,
        "relay finished"
    );

    engine.shutdown().await;
    let commands = engine.take_commands();
    lifecycle.close(&commands).await;
    debug!(session_id = %session_id, state = ?lifecycle.state(), "connection task done");
}

fn parse_host_id(value: Option<&str>) -> RelayResult<u64> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::Decode("missing host_id".into()))?;
    value
        .parse()
        .map_err(|_| RelayError::Decode(format!("invalid host_id: {value}")))
}

/// HTTP status for an error raised before the upgrade completes.
fn rejection_for(error: &RelayError) -> (u16, &'static str) {
    match error {
        RelayError::HostNotFound(_) => (404, "Not Found"),
        RelayError::Auth(_) => (401, "Unauthorized"),
        RelayError::Decode(_) => (400, "Bad Request"),
        RelayError::Config(_) | RelayError::Store(_) => (500, "Internal Server Error"),
        _ => (502, "Bad Gateway"),
    }
}
