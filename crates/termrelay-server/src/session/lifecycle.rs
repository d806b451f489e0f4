//! Per-session state machine: `negotiating → connected → relaying → closing → closed`.
//!
//! Owns the audit record for the session and the SSH transport handle, and
//! guarantees that the audit row is finalized and the transport released
//! exactly once, whichever termination path gets there first.

use async_trait::async_trait;
use std::sync::Arc;
use termrelay_core::{RelayError, RelayResult};
use tracing::{debug, error, info};

use crate::store::{AuditStatus, AuditUpdate, NewAuditRecord, RecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Connected,
    Relaying,
    Closing,
    Closed,
}

/// Something that holds remote connections open for the session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Disconnect every hop. Must tolerate repeated calls.
    async fn disconnect(&self);
}

/// Who and what an audit record describes.
#[derive(Debug, Clone)]
pub struct AuditSubject {
    /// Authenticated caller.
    pub username: String,
    pub ssh_host: String,
    pub ssh_user: String,
    /// Proxy external IP, empty for direct connections.
    pub proxy_host: String,
}

pub struct SessionLifecycle {
    session_id: String,
    store: Arc<dyn RecordStore>,
    state: SessionState,
    audit_id: Option<u64>,
    transport: Option<Arc<dyn SessionTransport>>,
}

impl SessionLifecycle {
    pub fn new(session_id: impl Into<String>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            session_id: session_id.into(),
            store,
            state: SessionState::Negotiating,
            audit_id: None,
            transport: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn audit_id(&self) -> Option<u64> {
        self.audit_id
    }

    /// Negotiation succeeded; the lifecycle now owns `transport`.
    pub fn connected(&mut self, transport: Arc<dyn SessionTransport>) -> RelayResult<()> {
        if self.state != SessionState::Negotiating {
            return Err(RelayError::Unhandled(format!(
                "cannot connect session in state {:?}",
                self.state
            )));
        }
        self.transport = Some(transport);
        self.state = SessionState::Connected;
        debug!(session_id = %self.session_id, "session connected");
        Ok(())
    }

    /// The client handshake completed: open the ONLINE audit record.
    pub async fn begin_relaying(&mut self, subject: &AuditSubject) -> RelayResult<u64> {
        if self.state != SessionState::Connected {
            return Err(RelayError::Unhandled(format!(
                "cannot start relaying in state {:?}",
                self.state
            )));
        }
        let id = self
            .store
            .create_audit_record(NewAuditRecord {
                username: subject.username.clone(),
                ssh_host: subject.ssh_host.clone(),
                ssh_user: subject.ssh_user.clone(),
                proxy_host: subject.proxy_host.clone(),
                status: AuditStatus::Online,
                ssh_command: String::new(),
            })
            .await?;
        self.audit_id = Some(id);
        self.state = SessionState::Relaying;
        info!(
            session_id = %self.session_id,
            audit_id = id,
            user = %subject.username,
            host = %subject.ssh_host,
            "session relaying"
        );
        Ok(id)
    }

    /// Finalize the audit record and release the transport.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&mut self, commands: &[String]) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        self.state = SessionState::Closing;

        if let Some(id) = self.audit_id {
            let update = AuditUpdate {
                status: AuditStatus::Offline,
                ssh_command: commands.join(","),
            };
            if let Err(e) = self.store.update_audit_record(id, update).await {
                error!(session_id = %self.session_id, audit_id = id, error = %e, "failed to finalize audit record");
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }

        self.state = SessionState::Closed;
        info!(
            session_id = %self.session_id,
            commands = commands.len(),
            "session closed"
        );
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    pub(crate) struct CountingTransport {
        pub disconnects: AtomicU32,
    }

    #[async_trait]
    impl SessionTransport for CountingTransport {
        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn subject() -> AuditSubject {
        AuditSubject {
            username: "alice".into(),
            ssh_host: "192.168.1.10".into(),
            ssh_user: "root".into(),
            proxy_host: "10.0.0.2".into(),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_writes_audit() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let mut lifecycle = SessionLifecycle::new("s1", store.clone());
        assert_eq!(lifecycle.state(), SessionState::Negotiating);

        lifecycle.connected(transport.clone()).unwrap();
        let id = lifecycle.begin_relaying(&subject()).await.unwrap();
        let record = store.get_audit_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, AuditStatus::Online);
        assert_eq!(record.proxy_host, "10.0.0.2");
        assert_eq!(record.ssh_command, "");

        assert!(lifecycle.close(&["ls -la".into(), "pwd".into()]).await);
        assert_eq!(lifecycle.state(), SessionState::Closed);
        let record = store.get_audit_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, AuditStatus::Offline);
        assert_eq!(record.ssh_command, "ls -la,pwd");
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let mut lifecycle = SessionLifecycle::new("s2", store.clone());
        lifecycle.connected(transport.clone()).unwrap();
        let id = lifecycle.begin_relaying(&subject()).await.unwrap();

        assert!(lifecycle.close(&["first".into()]).await);
        let first = store.get_audit_record(id).await.unwrap().unwrap();
        assert!(!lifecycle.close(&["second".into()]).await);
        let second = store.get_audit_record(id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.ssh_command, "first");
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_before_relaying_skips_audit() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(CountingTransport::default());
        let mut lifecycle = SessionLifecycle::new("s3", store.clone());
        lifecycle.connected(transport.clone()).unwrap();

        assert!(lifecycle.close(&[]).await);
        assert!(lifecycle.audit_id().is_none());
        assert!(store.get_audit_record(1).await.unwrap().is_none());
        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transitions_are_ordered() {
        let store = Arc::new(MemoryStore::new());
        let mut lifecycle = SessionLifecycle::new("s4", store);
        assert!(lifecycle.begin_relaying(&subject()).await.is_err());
        lifecycle
            .connected(Arc::new(CountingTransport::default()))
            .unwrap();
        assert!(lifecycle
            .connected(Arc::new(CountingTransport::default()))
            .is_err());
    }
}
