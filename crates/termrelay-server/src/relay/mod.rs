//! Bidirectional relay between a client link and a remote shell.
//!
//! The remote side is driven by a session-scoped worker task (see
//! [`crate::ssh::shell`]) that talks to the engine over bounded queues. The
//! client side and the SFTP side sit behind traits so the engine can run
//! against in-process fakes.

pub mod engine;
pub mod transfer;

pub use engine::RelayEngine;
pub use transfer::FileTransferAdapter;

use async_trait::async_trait;
use std::path::Path;
use termrelay_core::{Geometry, RelayResult, WireMessage};
use tokio::sync::mpsc;

/// Read size for remote shell output.
pub const SHELL_CHUNK_SIZE: usize = 2048;

/// Instructions from the engine to the shell worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Write(Vec<u8>),
    Resize(Geometry),
    Close,
}

/// Events from the shell worker, in the order they were read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Vec<u8>),
    /// The remote channel closed, with the exit status if one was reported.
    Exited(Option<u32>),
    Failed(String),
}

/// Engine-side ends of the shell worker's queues.
///
/// Commands are unbounded so the engine never waits on the worker while the
/// worker waits on a full events queue.
pub struct ShellHandle {
    pub commands: mpsc::UnboundedSender<ShellCommand>,
    pub events: mpsc::Receiver<ShellEvent>,
}

/// Worker-side ends of the shell worker's queues.
pub struct ShellPorts {
    pub commands: mpsc::UnboundedReceiver<ShellCommand>,
    pub events: mpsc::Sender<ShellEvent>,
}

impl ShellHandle {
    /// A connected handle/ports pair with `capacity` slots for output events.
    pub fn channel(capacity: usize) -> (ShellHandle, ShellPorts) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::channel(capacity);
        (
            ShellHandle {
                commands: cmd_tx,
                events: evt_rx,
            },
            ShellPorts {
                commands: cmd_rx,
                events: evt_tx,
            },
        )
    }
}

/// The client connection as seen by the engine.
#[async_trait]
pub trait ClientLink: Send {
    async fn send(&mut self, message: WireMessage) -> RelayResult<()>;

    /// Next message, or `None` once the client has gone away.
    async fn recv(&mut self) -> RelayResult<Option<WireMessage>>;

    async fn close(&mut self);
}

/// Remote file access for transfers.
#[async_trait]
pub trait RemoteFiles: Send {
    /// Copy `remote` into `local`, returning the byte count.
    async fn get(&mut self, remote: &str, local: &Path) -> RelayResult<u64>;

    /// Copy `local` to `remote`, returning the byte count.
    async fn put(&mut self, local: &Path, remote: &str) -> RelayResult<u64>;

    async fn close(&mut self);
}
