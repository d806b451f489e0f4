//! Session lifecycle and audit binding.

pub mod lifecycle;

pub use lifecycle::{AuditSubject, SessionLifecycle, SessionState, SessionTransport};

use rand::Rng;

/// Random hex id tying log lines to one client connection.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
