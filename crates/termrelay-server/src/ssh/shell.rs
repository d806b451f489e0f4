//! Session-scoped worker task that owns the interactive PTY channel.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::relay::{ShellCommand, ShellEvent, ShellHandle, ShellPorts, SHELL_CHUNK_SIZE};

const QUEUE_DEPTH: usize = 256;

/// Spawn the worker for `channel` and return the engine's side of its queues.
pub fn spawn_shell_worker(session_id: String, channel: Channel<Msg>) -> ShellHandle {
    let (handle, ports) = ShellHandle::channel(QUEUE_DEPTH);
    tokio::spawn(run_shell_worker(session_id, channel, ports));
    handle
}

async fn run_shell_worker(session_id: String, mut channel: Channel<Msg>, ports: ShellPorts) {
    let ShellPorts {
        mut commands,
        events,
    } = ports;
    let mut exit_status = None;
    debug!(session_id = %session_id, "shell worker started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShellCommand::Write(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!(session_id = %session_id, error = %e, "write to shell failed");
                        let _ = events.send(ShellEvent::Failed(format!("write failed: {e}"))).await;
                        break;
                    }
                }
                Some(ShellCommand::Resize(geometry)) => {
                    debug!(session_id = %session_id, cols = geometry.cols, rows = geometry.rows, "resizing pty");
                    if let Err(e) = channel.window_change(geometry.cols, geometry.rows, 0, 0).await {
                        warn!(session_id = %session_id, error = %e, "pty resize failed");
                    }
                }
                Some(ShellCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    if !forward(&events, &data).await {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 && !forward(&events, &data).await {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    info!(session_id = %session_id, exit_status = code, "remote process exited");
                    exit_status = Some(code);
                }
                Some(ChannelMsg::Close) | None => {
                    let _ = events.send(ShellEvent::Exited(exit_status)).await;
                    break;
                }
                Some(_) => {}
            },
        }
    }

    debug!(session_id = %session_id, "shell worker stopped");
}

/// Send `data` to the engine in bounded chunks. Returns `false` once the
/// engine has gone away.
async fn forward(events: &mpsc::Sender<ShellEvent>, data: &[u8]) -> bool {
    for chunk in data.chunks(SHELL_CHUNK_SIZE) {
        if events.send(ShellEvent::Output(chunk.to_vec())).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn large_output_is_chunked() {
        let (tx, mut rx) = mpsc::channel(16);
        let data = vec![b'x'; SHELL_CHUNK_SIZE * 2 + 10];
        assert!(forward(&tx, &data).await);

        let mut sizes = Vec::new();
        while let Ok(ShellEvent::Output(chunk)) = rx.try_recv() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![SHELL_CHUNK_SIZE, SHELL_CHUNK_SIZE, 10]);
    }

    #[tokio::test]
    async fn forward_reports_closed_engine() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!forward(&tx, b"late").await);
    }
}
