//! In-memory record store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use termrelay_core::{RelayError, RelayResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::journal::{load_journal, AuditJournal, JournalOp};
use super::{
    proxy_ip_list, unix_now, AuditRecord, AuditUpdate, Host, NewAuditRecord, NewHost,
    RecordStore,
};

pub struct MemoryStore {
    hosts: RwLock<BTreeMap<u64, Host>>,
    audits: RwLock<BTreeMap<u64, AuditRecord>>,
    next_host_id: AtomicU64,
    next_audit_id: AtomicU64,
    journal: Option<AuditJournal>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(BTreeMap::new()),
            audits: RwLock::new(BTreeMap::new()),
            next_host_id: AtomicU64::new(1),
            next_audit_id: AtomicU64::new(1),
            journal: None,
        }
    }

    /// A store that journals audit writes to `journal`, first replaying any
    /// records the journal already holds.
    pub async fn with_journal(journal: AuditJournal) -> RelayResult<Self> {
        let mut store = Self::new();
        if tokio::fs::try_exists(journal.path()).await? {
            let entries = load_journal(journal.path()).await?;
            let mut audits = store.audits.write().await;
            for entry in entries {
                audits.insert(entry.record.id, entry.record);
            }
            let next = audits.keys().next_back().map_or(1, |id| id + 1);
            store.next_audit_id.store(next, Ordering::SeqCst);
            info!(
                path = %journal.path().display(),
                records = audits.len(),
                "restored audit records from journal"
            );
        }
        store.journal = Some(journal);
        Ok(store)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_host_record(&self, new: NewHost) -> RelayResult<Host> {
        let mut hosts = self.hosts.write().await;
        let id = match new.id {
            Some(id) => {
                if hosts.contains_key(&id) {
                    return Err(RelayError::Store(format!("duplicate host id {id}")));
                }
                self.next_host_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_host_id.fetch_add(1, Ordering::SeqCst),
        };
        let host = Host {
            id,
            name: new.name,
            external_ip: new.external_ip,
            port: new.port,
            login_user: new.login_user,
            password: new.password,
            proxy_ips: new.proxy_ips,
        };
        hosts.insert(id, host.clone());
        debug!(host_id = id, ip = %host.external_ip, "host record created");
        Ok(host)
    }

    async fn get_host(&self, id: u64) -> RelayResult<Option<Host>> {
        Ok(self.hosts.read().await.get(&id).cloned())
    }

    async fn find_host_by_ip(&self, ip: &str) -> RelayResult<Option<Host>> {
        Ok(self
            .hosts
            .read()
            .await
            .values()
            .find(|h| h.external_ip == ip)
            .cloned())
    }

    async fn list_proxy_candidates(&self, host: &Host) -> RelayResult<Vec<Host>> {
        let hosts = self.hosts.read().await;
        Ok(proxy_ip_list(&host.proxy_ips)
            .filter_map(|ip| hosts.values().find(|h| h.external_ip == ip).cloned())
            .collect())
    }

    async fn create_audit_record(&self, new: NewAuditRecord) -> RelayResult<u64> {
        let id = self.next_audit_id.fetch_add(1, Ordering::SeqCst);
        let now = unix_now();
        let record = AuditRecord {
            id,
            username: new.username,
            ssh_host: new.ssh_host,
            ssh_user: new.ssh_user,
            proxy_host: new.proxy_host,
            status: new.status,
            ssh_command: new.ssh_command,
            created_at: now,
            updated_at: now,
        };
        self.audits.write().await.insert(id, record.clone());
        if let Some(journal) = &self.journal {
            journal.append(JournalOp::Create, &record).await;
        }
        Ok(id)
    }

    async fn update_audit_record(&self, id: u64, update: AuditUpdate) -> RelayResult<()> {
        let record = {
            let mut audits = self.audits.write().await;
            let record = audits
                .get_mut(&id)
                .ok_or_else(|| RelayError::Store(format!("audit record {id} not found")))?;
            record.status = update.status;
            record.ssh_command = update.ssh_command;
            record.updated_at = unix_now();
            record.clone()
        };
        if let Some(journal) = &self.journal {
            journal.append(JournalOp::Update, &record).await;
        }
        Ok(())
    }

    async fn get_audit_record(&self, id: u64) -> RelayResult<Option<AuditRecord>> {
        Ok(self.audits.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditStatus;

    fn new_host(ip: &str, proxy_ips: &str) -> NewHost {
        NewHost {
            id: None,
            name: ip.to_string(),
            external_ip: ip.to_string(),
            port: 22,
            login_user: "root".into(),
            password: String::new(),
            proxy_ips: proxy_ips.into(),
        }
    }

    fn new_audit() -> NewAuditRecord {
        NewAuditRecord {
            username: "alice".into(),
            ssh_host: "192.168.1.10".into(),
            ssh_user: "root".into(),
            proxy_host: String::new(),
            status: AuditStatus::Online,
            ssh_command: String::new(),
        }
    }

    #[tokio::test]
    async fn host_ids_assigned_and_explicit() {
        let store = MemoryStore::new();
        let mut explicit = new_host("10.0.0.5", "");
        explicit.id = Some(5);
        assert_eq!(store.create_host_record(explicit.clone()).await.unwrap().id, 5);
        assert_eq!(store.create_host_record(new_host("10.0.0.6", "")).await.unwrap().id, 6);
        assert!(store.create_host_record(explicit).await.is_err());
        assert_eq!(
            store.find_host_by_ip("10.0.0.6").await.unwrap().map(|h| h.id),
            Some(6)
        );
        assert!(store.get_host(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn proxy_candidates_follow_configured_order() {
        let store = MemoryStore::new();
        store.create_host_record(new_host("10.0.0.2", "")).await.unwrap();
        store.create_host_record(new_host("10.0.0.1", "")).await.unwrap();
        let target = store
            .create_host_record(new_host("192.168.1.10", "10.0.0.1, 10.0.0.9,10.0.0.2"))
            .await
            .unwrap();
        let ips: Vec<String> = store
            .list_proxy_candidates(&target)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.external_ip)
            .collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn audit_create_then_update() {
        let store = MemoryStore::new();
        let id = store.create_audit_record(new_audit()).await.unwrap();
        store
            .update_audit_record(
                id,
                AuditUpdate {
                    status: AuditStatus::Offline,
                    ssh_command: "ls,pwd".into(),
                },
            )
            .await
            .unwrap();
        let record = store.get_audit_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, AuditStatus::Offline);
        assert_eq!(record.ssh_command, "ls,pwd");
        assert!(store
            .update_audit_record(
                id + 1,
                AuditUpdate {
                    status: AuditStatus::Offline,
                    ssh_command: String::new(),
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn journal_is_replayed_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let store = MemoryStore::with_journal(AuditJournal::new(path.clone())).await.unwrap();
        let id = store.create_audit_record(new_audit()).await.unwrap();
        store
            .update_audit_record(
                id,
                AuditUpdate {
                    status: AuditStatus::Offline,
                    ssh_command: "uptime".into(),
                },
            )
            .await
            .unwrap();
        drop(store);

        let restored = MemoryStore::with_journal(AuditJournal::new(path)).await.unwrap();
        let record = restored.get_audit_record(id).await.unwrap().unwrap();
        assert_eq!(record.ssh_command, "uptime");
        let next = restored.create_audit_record(new_audit()).await.unwrap();
        assert_eq!(next, id + 1);
    }
}
