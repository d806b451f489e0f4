//! Client-facing transport.

pub mod websocket;

pub use websocket::{PendingConnection, UpgradeRequest};
