//! Host and audit records.
//!
//! The relay only needs single-row reads and writes, exposed through
//! [`RecordStore`]. [`MemoryStore`] is the in-process implementation, seeded
//! from the config file and optionally journaling audit rows to disk.

pub mod journal;
pub mod memory;

pub use journal::AuditJournal;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use termrelay_core::RelayResult;

/// A registered SSH host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: u64,
    pub name: String,
    pub external_ip: String,
    pub port: u16,
    pub login_user: String,
    /// Encrypted login password.
    pub password: String,
    /// Comma-separated proxy IPs, may be empty.
    pub proxy_ips: String,
}

/// Fields for a new host; `id` is assigned when absent.
#[derive(Debug, Clone)]
pub struct NewHost {
    pub id: Option<u64>,
    pub name: String,
    pub external_ip: String,
    pub port: u16,
    pub login_user: String,
    pub password: String,
    pub proxy_ips: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Online,
    Offline,
}

/// One audited terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    /// Authenticated caller, not the SSH login.
    pub username: String,
    pub ssh_host: String,
    pub ssh_user: String,
    /// Proxy external IP, or empty for direct connections.
    pub proxy_host: String,
    pub status: AuditStatus,
    pub ssh_command: String,
    /// Unix seconds.
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub username: String,
    pub ssh_host: String,
    pub ssh_user: String,
    pub proxy_host: String,
    pub status: AuditStatus,
    pub ssh_command: String,
}

#[derive(Debug, Clone)]
pub struct AuditUpdate {
    pub status: AuditStatus,
    pub ssh_command: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_host_record(&self, host: NewHost) -> RelayResult<Host>;

    async fn get_host(&self, id: u64) -> RelayResult<Option<Host>>;

    async fn find_host_by_ip(&self, ip: &str) -> RelayResult<Option<Host>>;

    /// Registered hosts for each of `host`'s proxy IPs, in configured order.
    async fn list_proxy_candidates(&self, host: &Host) -> RelayResult<Vec<Host>>;

    async fn create_audit_record(&self, record: NewAuditRecord) -> RelayResult<u64>;

    async fn update_audit_record(&self, id: u64, update: AuditUpdate) -> RelayResult<()>;

    async fn get_audit_record(&self, id: u64) -> RelayResult<Option<AuditRecord>>;
}

/// Split a comma-separated proxy list, skipping blank entries.
pub fn proxy_ip_list(proxy_ips: &str) -> impl Iterator<Item = &str> {
    proxy_ips.split(',').map(str::trim).filter(|ip| !ip.is_empty())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_list_skips_blanks() {
        let ips: Vec<&str> = proxy_ip_list(" 10.0.0.1, ,10.0.0.2,").collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(proxy_ip_list("").count(), 0);
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&AuditStatus::Online).unwrap(), "\"ONLINE\"");
    }
}
