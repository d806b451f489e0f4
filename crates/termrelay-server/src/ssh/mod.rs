//! Outbound SSH: connection negotiation, the shell worker and SFTP access.

pub mod negotiator;
pub mod sftp;
pub mod shell;
pub mod transport;

pub use negotiator::Negotiator;
pub use sftp::SftpFiles;
pub use shell::spawn_shell_worker;
