//! The per-session relay loop.
//!
//! Multiplexes client frames, shell worker events and transfer outcomes with
//! `tokio::select!`. Remote output is forwarded in read order and client input
//! is applied in receive order; nothing is buffered or reordered in between.
//! The loop only ever awaits the client socket, so file transfers and a busy
//! shell cannot stall each other.

use termrelay_core::{
    ClientFrame, CommandBuffer, Geometry, RelayError, RelayResult, ServerFrame, Utf8Decoder,
    WireMessage,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::transfer::{FileTransferAdapter, TransferHandle, TransferJob, TransferOutcome};
use super::{ClientLink, RemoteFiles, ShellCommand, ShellEvent, ShellHandle};

/// Upload name used until the client announces one.
pub const DEFAULT_UPLOAD_NAME: &str = "tmp_name";

/// Why the relay loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    RemoteExited(Option<u32>),
    ChannelFailed(String),
    Unhandled(String),
    Shutdown,
}

impl From<RelayError> for CloseReason {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Transport(_) => CloseReason::ClientDisconnected,
            RelayError::Channel(msg) => CloseReason::ChannelFailed(msg),
            other => CloseReason::Unhandled(other.to_string()),
        }
    }
}

pub struct RelayEngine<L> {
    session_id: String,
    client: L,
    shell: ShellHandle,
    transfers: TransferHandle,
    commands: CommandBuffer,
    decoder: Utf8Decoder,
    geometry: Geometry,
    upload_name: String,
    finished: bool,
}

impl<L: ClientLink> RelayEngine<L> {
    pub fn new<F: RemoteFiles + 'static>(
        session_id: impl Into<String>,
        client: L,
        shell: ShellHandle,
        transfers: FileTransferAdapter<F>,
        geometry: Geometry,
    ) -> Self {
        let session_id = session_id.into();
        let transfers = transfers.spawn(session_id.clone());
        Self {
            session_id,
            client,
            shell,
            transfers,
            commands: CommandBuffer::new(),
            decoder: Utf8Decoder::new(),
            geometry,
            upload_name: DEFAULT_UPLOAD_NAME.to_string(),
            finished: false,
        }
    }

    /// Relay until either side goes away or `shutdown` fires.
    ///
    /// `banner` is output the negotiator already read from the shell.
    pub async fn run(
        &mut self,
        banner: &[u8],
        mut shutdown: broadcast::Receiver<()>,
    ) -> CloseReason {
        if !banner.is_empty() {
            if let Err(e) = self.send_output(banner).await {
                return e.into();
            }
        }

        loop {
            tokio::select! {
                event = self.shell.events.recv() => match event {
                    Some(ShellEvent::Output(bytes)) => {
                        if let Err(e) = self.forward_output(&bytes).await {
                            warn!(session_id = %self.session_id, error = %e, kind = e.kind(), "failed to forward output");
                            return e.into();
                        }
                    }
                    Some(ShellEvent::Exited(code)) => {
                        info!(session_id = %self.session_id, exit_status = ?code, "remote shell exited");
                        return CloseReason::RemoteExited(code);
                    }
                    Some(ShellEvent::Failed(msg)) => {
                        warn!(session_id = %self.session_id, error = %msg, "remote channel failed");
                        return CloseReason::ChannelFailed(msg);
                    }
                    None => return CloseReason::RemoteExited(None),
                },
                message = self.client.recv() => match message {
                    Ok(Some(message)) => {
                        if let Err(e) = self.dispatch(ClientFrame::decode(message)).await {
                            if e.is_fatal() {
                                warn!(session_id = %self.session_id, error = %e, kind = e.kind(), "relay error");
                                return e.into();
                            }
                            debug!(session_id = %self.session_id, error = %e, "recoverable relay error");
                        }
                    }
                    Ok(None) => {
                        debug!(session_id = %self.session_id, "client disconnected");
                        return CloseReason::ClientDisconnected;
                    }
                    Err(e) => {
                        debug!(session_id = %self.session_id, error = %e, "client receive failed");
                        return CloseReason::ClientDisconnected;
                    }
                },
                Some(outcome) = self.transfers.outcomes.recv() => {
                    if let Err(e) = self.deliver(outcome).await {
                        warn!(session_id = %self.session_id, error = %e, kind = e.kind(), "failed to deliver transfer result");
                        return e.into();
                    }
                }
                _ = shutdown.recv() => {
                    info!(session_id = %self.session_id, "relay stopped by server shutdown");
                    return CloseReason::Shutdown;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) -> RelayResult<()> {
        match frame {
            ClientFrame::Resize(geometry) => {
                self.geometry = geometry;
                debug!(session_id = %self.session_id, cols = self.geometry.cols, rows = self.geometry.rows, "client resized terminal");
                self.to_shell(ShellCommand::Resize(geometry))
            }
            ClientFrame::Content(text) => {
                self.commands.feed_input(&text);
                self.to_shell(ShellCommand::Write(text.into_bytes()))
            }
            ClientFrame::Heartbeat => self.send_frame(ServerFrame::pong()).await,
            ClientFrame::Download(remote_path) => {
                self.submit_transfer("download", TransferJob::Download(remote_path))
                    .await
            }
            ClientFrame::Upload(name) => {
                debug!(session_id = %self.session_id, name = %name, "upload announced");
                self.upload_name = name;
                Ok(())
            }
            ClientFrame::UploadData(payload) => {
                let job = TransferJob::Upload {
                    name: self.upload_name.clone(),
                    payload,
                };
                self.submit_transfer("upload", job).await
            }
            ClientFrame::RawFallback(text) => {
                self.to_shell(ShellCommand::Write(text.into_bytes()))
            }
        }
    }

    async fn forward_output(&mut self, bytes: &[u8]) -> RelayResult<()> {
        let text = self.send_output(bytes).await?;
        self.commands.observe_output(&text);
        Ok(())
    }

    async fn send_output(&mut self, bytes: &[u8]) -> RelayResult<String> {
        let text = self.decoder.decode(bytes);
        if !text.is_empty() {
            self.send_frame(ServerFrame::Content(text.clone())).await?;
        }
        Ok(text)
    }

    async fn submit_transfer(&mut self, op: &str, job: TransferJob) -> RelayResult<()> {
        match self.transfers.submit(job) {
            Ok(()) => Ok(()),
            Err(e) => self.report_transfer_error(op, e).await,
        }
    }

    async fn deliver(&mut self, outcome: TransferOutcome) -> RelayResult<()> {
        match outcome {
            TransferOutcome::Downloaded {
                remote,
                file_name,
                bytes,
            } => {
                info!(session_id = %self.session_id, remote = %remote, bytes = bytes.len(), "download sent");
                self.send_frame(ServerFrame::File(file_name)).await?;
                self.client.send(WireMessage::Binary(bytes)).await
            }
            TransferOutcome::Uploaded { remote, bytes } => {
                info!(session_id = %self.session_id, remote = %remote, bytes, "upload stored");
                self.send_frame(ServerFrame::Success(format!(
                    "upload succeeded, saved to {remote}"
                )))
                .await
            }
            TransferOutcome::Failed { op, error } => self.report_transfer_error(op, error).await,
        }
    }

    async fn report_transfer_error(&mut self, op: &str, e: RelayError) -> RelayResult<()> {
        warn!(session_id = %self.session_id, op, error = %e, "transfer failed");
        let message = match e {
            RelayError::Transfer(msg) => msg,
            other => other.to_string(),
        };
        self.send_frame(ServerFrame::Error(format!("{op} failed: {message}")))
            .await
    }

    async fn send_frame(&mut self, frame: ServerFrame) -> RelayResult<()> {
        self.client.send(frame.into_wire()?).await
    }

    fn to_shell(&self, command: ShellCommand) -> RelayResult<()> {
        self.shell
            .commands
            .send(command)
            .map_err(|_| RelayError::Channel("shell worker stopped".into()))
    }

    /// Release the shell, the SFTP sub-channel and the client socket.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // The worker may already be gone after a remote exit.
        let _ = self.shell.commands.send(ShellCommand::Close);
        self.transfers.close().await;
        self.client.close().await;
        debug!(session_id = %self.session_id, "relay resources released");
    }

    /// The reconstructed command list, cleaned of editor noise.
    pub fn take_commands(&mut self) -> Vec<String> {
        std::mem::take(&mut self.commands).finish()
    }
}

#[cfg(test)]
impl<L> RelayEngine<L> {
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn upload_name(&self) -> &str {
        &self.upload_name
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.commands
    }
}
