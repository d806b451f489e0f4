//! Append-only audit journal.
//!
//! Every audit create/update is written as one JSON line so session history
//! survives restarts of the in-memory store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::error;

use super::{unix_now, AuditRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalOp {
    Create,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unix seconds.
    pub at: u64,
    pub op: JournalOp,
    pub record: AuditRecord,
}

pub struct AuditJournal {
    path: PathBuf,
}

impl AuditJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry. Errors are logged but do not propagate; the store
    /// itself stays authoritative.
    pub async fn append(&self, op: JournalOp, record: &AuditRecord) {
        let entry = JournalEntry {
            at: unix_now(),
            op,
            record: record.clone(),
        };

        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = self.append_line(&line).await {
                    error!(path = %self.path.display(), error = %e, "failed to write audit journal");
                }
            }
            Err(e) => {
                error!(error = %e, "failed to serialize audit journal entry");
            }
        }
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Load a journal from file.
pub async fn load_journal(path: &Path) -> std::io::Result<Vec<JournalEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed journal line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AuditStatus;

    fn record(status: AuditStatus, cmd: &str) -> AuditRecord {
        AuditRecord {
            id: 1,
            username: "alice".into(),
            ssh_host: "192.168.1.10".into(),
            ssh_user: "root".into(),
            proxy_host: String::new(),
            status,
            ssh_command: cmd.into(),
            created_at: 1,
            updated_at: 2,
        }
    }

    #[tokio::test]
    async fn appends_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = AuditJournal::new(dir.path().join("audit").join("journal.jsonl"));
        journal.append(JournalOp::Create, &record(AuditStatus::Online, "")).await;
        journal
            .append(JournalOp::Update, &record(AuditStatus::Offline, "ls,pwd"))
            .await;

        let entries = load_journal(journal.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, JournalOp::Create);
        assert_eq!(entries[1].record.status, AuditStatus::Offline);
        assert_eq!(entries[1].record.ssh_command, "ls,pwd");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = AuditJournal::new(path.clone());
        journal.append(JournalOp::Create, &record(AuditStatus::Online, "")).await;
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("not json\n");
        tokio::fs::write(&path, content).await.unwrap();

        assert_eq!(load_journal(&path).await.unwrap().len(), 1);
    }
}
