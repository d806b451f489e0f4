//! SFTP sub-channel, opened lazily on the session's SSH transport.

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use termrelay_core::{RelayError, RelayResult};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::transport::SshTransport;
use crate::relay::RemoteFiles;

pub struct SftpFiles {
    session_id: String,
    transport: Arc<SshTransport>,
    sftp: Option<SftpSession>,
}

impl SftpFiles {
    pub fn new(session_id: impl Into<String>, transport: Arc<SshTransport>) -> Self {
        Self {
            session_id: session_id.into(),
            transport,
            sftp: None,
        }
    }

    async fn session(&mut self) -> RelayResult<&SftpSession> {
        if self.sftp.is_none() {
            let channel = self
                .transport
                .open_session_channel()
                .await
                .map_err(|e| RelayError::Transfer(e.to_string()))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| RelayError::Transfer(format!("sftp subsystem request failed: {e}")))?;
            let sftp = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| RelayError::Transfer(format!("sftp init failed: {e}")))?;
            debug!(session_id = %self.session_id, "sftp sub-channel opened");
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| RelayError::Transfer("sftp unavailable".into()))
    }
}

#[async_trait]
impl RemoteFiles for SftpFiles {
    async fn get(&mut self, remote: &str, local: &Path) -> RelayResult<u64> {
        let sftp = self.session().await?;
        let mut source = sftp
            .open(remote)
            .await
            .map_err(|e| RelayError::Transfer(format!("{remote}: {e}")))?;
        let mut target = tokio::fs::File::create(local)
            .await
            .map_err(|e| RelayError::Transfer(format!("cannot create staging file: {e}")))?;
        let bytes = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(|e| RelayError::Transfer(format!("{remote}: {e}")))?;
        target.flush().await?;
        Ok(bytes)
    }

    async fn put(&mut self, local: &Path, remote: &str) -> RelayResult<u64> {
        let sftp = self.session().await?;
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| RelayError::Transfer(format!("cannot open staging file: {e}")))?;
        let mut target = sftp
            .create(remote)
            .await
            .map_err(|e| RelayError::Transfer(format!("{remote}: {e}")))?;
        let bytes = tokio::io::copy(&mut source, &mut target)
            .await
            .map_err(|e| RelayError::Transfer(format!("{remote}: {e}")))?;
        target
            .shutdown()
            .await
            .map_err(|e| RelayError::Transfer(format!("{remote}: {e}")))?;
        Ok(bytes)
    }

    async fn close(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                warn!(session_id = %self.session_id, error = %e, "sftp close failed");
            }
        }
    }
}
