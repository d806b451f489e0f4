//! The SSH connection(s) backing one session: the target, and the proxy hop
//! it was tunnelled through, if any.

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, Disconnect};
use std::sync::atomic::{AtomicBool, Ordering};
use termrelay_core::{RelayError, RelayResult};
use tracing::{debug, warn};

use crate::session::SessionTransport;

/// russh client handler. Host keys are accepted without verification.
pub struct RelayClientHandler {
    host: String,
}

impl RelayClientHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl client::Handler for RelayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host = %self.host,
            key_type = ?server_public_key.algorithm(),
            "accepting server host key"
        );
        Ok(true)
    }
}

pub struct SshTransport {
    host: String,
    target: Handle<RelayClientHandler>,
    proxy: Option<Handle<RelayClientHandler>>,
    closed: AtomicBool,
}

impl SshTransport {
    pub fn new(
        host: impl Into<String>,
        target: Handle<RelayClientHandler>,
        proxy: Option<Handle<RelayClientHandler>>,
    ) -> Self {
        Self {
            host: host.into(),
            target,
            proxy,
            closed: AtomicBool::new(false),
        }
    }

    /// Open another session channel on the target connection.
    pub async fn open_session_channel(&self) -> RelayResult<Channel<Msg>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Channel("transport already closed".into()));
        }
        self.target
            .channel_open_session()
            .await
            .map_err(|e| RelayError::Channel(format!("channel open failed: {e}")))
    }
}

#[async_trait]
impl SessionTransport for SshTransport {
    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .target
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(host = %self.host, error = %e, "target disconnect failed");
        }
        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await
            {
                warn!(host = %self.host, error = %e, "proxy disconnect failed");
            }
        }
        debug!(host = %self.host, "ssh transport closed");
    }
}
