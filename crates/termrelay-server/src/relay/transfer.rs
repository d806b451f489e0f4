//! Inline SFTP upload/download through local staging files.
//!
//! Transfers run on a session-scoped task ([`FileTransferAdapter::spawn`])
//! so a slow SFTP get or put never holds up the relay loop. Jobs go in over
//! one queue and outcomes come back over another, in submission order.

use std::path::{Path, PathBuf};
use std::time::Duration;
use termrelay_core::{file_name, staging_file_name, RelayError, RelayResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::RemoteFiles;

/// A downloaded file waiting to be sent to the client.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Name shown to the client.
    pub file_name: String,
}

impl StagedFile {
    pub async fn read(&self) -> RelayResult<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| RelayError::Transfer(format!("cannot read staged file: {e}")))
    }

    /// Delete the staging file.
    pub async fn discard(self) {
        remove_staging(&self.path).await;
    }
}

pub struct FileTransferAdapter<F> {
    files: F,
    staging_dir: PathBuf,
    upload_dir: String,
}

impl<F: RemoteFiles> FileTransferAdapter<F> {
    pub fn new(files: F, staging_dir: PathBuf, upload_dir: impl Into<String>) -> Self {
        Self {
            files,
            staging_dir,
            upload_dir: upload_dir.into(),
        }
    }

    /// Remote destination for an announced upload name. Only the final
    /// path segment of `name` is used.
    pub fn upload_path(&self, name: &str) -> RelayResult<String> {
        let base = file_name(name);
        if base.is_empty() || base == "." || base == ".." {
            return Err(RelayError::Transfer(format!("invalid upload name: {name:?}")));
        }
        Ok(format!("{}/{}", self.upload_dir.trim_end_matches('/'), base))
    }

    /// Fetch `remote_path` into a staging file.
    pub async fn fetch(&mut self, remote_path: &str) -> RelayResult<StagedFile> {
        let local = self.staging_dir.join(staging_file_name(remote_path));
        match self.files.get(remote_path, &local).await {
            Ok(bytes) => {
                debug!(remote = remote_path, bytes, "download staged");
                Ok(StagedFile {
                    path: local,
                    file_name: file_name(remote_path).to_string(),
                })
            }
            Err(e) => {
                remove_staging(&local).await;
                Err(e)
            }
        }
    }

    /// Write `payload` to the upload directory under `name`. Returns the
    /// remote path.
    pub async fn store(&mut self, name: &str, payload: &[u8]) -> RelayResult<String> {
        let remote_path = self.upload_path(name)?;
        let local = self.staging_dir.join(staging_file_name(&remote_path));

        let result: RelayResult<u64> = async {
            tokio::fs::write(&local, payload)
                .await
                .map_err(|e| RelayError::Transfer(format!("cannot write staging file: {e}")))?;
            self.files.put(&local, &remote_path).await
        }
        .await;
        remove_staging(&local).await;

        let bytes = result?;
        debug!(remote = %remote_path, bytes, "upload stored");
        Ok(remote_path)
    }

    pub async fn close(&mut self) {
        self.files.close().await;
    }

    /// Move the adapter onto its own task.
    pub fn spawn(self, session_id: String) -> TransferHandle
    where
        F: 'static,
    {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_transfers(session_id, self, jobs_rx, outcomes_tx));
        TransferHandle {
            jobs: Some(jobs_tx),
            outcomes: outcomes_rx,
            task: Some(task),
        }
    }

    async fn run(&mut self, job: TransferJob) -> TransferOutcome {
        match job {
            TransferJob::Download(remote) => match self.download(&remote).await {
                Ok((file_name, bytes)) => TransferOutcome::Downloaded {
                    remote,
                    file_name,
                    bytes,
                },
                Err(error) => TransferOutcome::Failed {
                    op: "download",
                    error,
                },
            },
            TransferJob::Upload { name, payload } => match self.store(&name, &payload).await {
                Ok(remote) => TransferOutcome::Uploaded {
                    remote,
                    bytes: payload.len(),
                },
                Err(error) => TransferOutcome::Failed { op: "upload", error },
            },
        }
    }

    async fn download(&mut self, remote_path: &str) -> RelayResult<(String, Vec<u8>)> {
        let staged = self.fetch(remote_path).await?;
        let payload = staged.read().await;
        let file_name = staged.file_name.clone();
        staged.discard().await;
        Ok((file_name, payload?))
    }
}

/// How long `TransferHandle::close` waits for an in-flight transfer.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Work for the transfer task.
#[derive(Debug)]
pub enum TransferJob {
    Download(String),
    Upload { name: String, payload: Vec<u8> },
}

/// What the transfer task reports back for each job.
#[derive(Debug)]
pub enum TransferOutcome {
    Downloaded {
        remote: String,
        file_name: String,
        bytes: Vec<u8>,
    },
    Uploaded {
        remote: String,
        bytes: usize,
    },
    Failed {
        op: &'static str,
        error: RelayError,
    },
}

/// Engine-side ends of a running transfer task.
pub struct TransferHandle {
    jobs: Option<mpsc::UnboundedSender<TransferJob>>,
    pub outcomes: mpsc::UnboundedReceiver<TransferOutcome>,
    task: Option<JoinHandle<()>>,
}

impl TransferHandle {
    pub fn submit(&self, job: TransferJob) -> RelayResult<()> {
        self.jobs
            .as_ref()
            .ok_or_else(|| RelayError::Transfer("transfers are closed".into()))?
            .send(job)
            .map_err(|_| RelayError::Transfer("transfer task stopped".into()))
    }

    /// Stop taking jobs and wait for the task to release the remote side.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        self.jobs.take();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("transfer still running at close, aborting it");
                task.abort();
            }
        }
    }
}

async fn run_transfers<F: RemoteFiles>(
    session_id: String,
    mut adapter: FileTransferAdapter<F>,
    mut jobs: mpsc::UnboundedReceiver<TransferJob>,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
) {
    debug!(session_id = %session_id, "transfer task started");
    while let Some(job) = jobs.recv().await {
        let outcome = adapter.run(job).await;
        if outcomes.send(outcome).is_err() {
            break;
        }
    }
    adapter.close().await;
    debug!(session_id = %session_id, "transfer task stopped");
}

async fn remove_staging(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staging file"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Remote file system backed by a shared map.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryFiles {
        pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub closed: Arc<Mutex<u32>>,
    }

    impl MemoryFiles {
        pub fn with_file(path: &str, content: &[u8]) -> Self {
            let files = Self::default();
            files
                .files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_vec());
            files
        }

        pub fn get_file(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(path).cloned()
        }
    }

    #[async_trait]
    impl RemoteFiles for MemoryFiles {
        async fn get(&mut self, remote: &str, local: &Path) -> RelayResult<u64> {
            let content = self
                .get_file(remote)
                .ok_or_else(|| RelayError::Transfer(format!("no such file: {remote}")))?;
            tokio::fs::write(local, &content).await?;
            Ok(content.len() as u64)
        }

        async fn put(&mut self, local: &Path, remote: &str) -> RelayResult<u64> {
            if remote.starts_with("/readonly") {
                return Err(RelayError::Transfer("permission denied".into()));
            }
            let content = tokio::fs::read(local).await?;
            let len = content.len() as u64;
            self.files.lock().unwrap().insert(remote.to_string(), content);
            Ok(len)
        }

        async fn close(&mut self) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    fn staging_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn download_stages_then_discards() {
        let dir = tempfile::tempdir().unwrap();
        let files = MemoryFiles::with_file("/etc/app.conf", b"key=value");
        let mut adapter = FileTransferAdapter::new(files, dir.path().to_path_buf(), "/tmp");

        let staged = adapter.fetch("/etc/app.conf").await.unwrap();
        assert_eq!(staged.file_name, "app.conf");
        assert!(staged.path.to_string_lossy().ends_with(".conf"));
        assert_eq!(staged.read().await.unwrap(), b"key=value");
        staged.discard().await;
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn missing_download_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter =
            FileTransferAdapter::new(MemoryFiles::default(), dir.path().to_path_buf(), "/tmp");
        let err = adapter.fetch("/nope").await.unwrap_err();
        assert!(matches!(err, RelayError::Transfer(_)));
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn upload_lands_in_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let files = MemoryFiles::default();
        let mut adapter =
            FileTransferAdapter::new(files.clone(), dir.path().to_path_buf(), "/srv/uploads/");

        let remote = adapter.store("report.csv", b"a,b\n").await.unwrap();
        assert_eq!(remote, "/srv/uploads/report.csv");
        assert_eq!(files.get_file("/srv/uploads/report.csv").unwrap(), b"a,b\n");
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn failed_upload_still_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mut adapter =
            FileTransferAdapter::new(MemoryFiles::default(), dir.path().to_path_buf(), "/readonly");
        assert!(adapter.store("x.bin", b"\0").await.is_err());
        assert!(staging_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn spawned_adapter_reports_in_order_and_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        let files = MemoryFiles::with_file("/etc/motd", b"hi");
        let adapter = FileTransferAdapter::new(files.clone(), dir.path().to_path_buf(), "/tmp");
        let mut handle = adapter.spawn("test".into());

        handle.submit(TransferJob::Download("/etc/motd".into())).unwrap();
        handle
            .submit(TransferJob::Upload {
                name: "a.txt".into(),
                payload: b"abc".to_vec(),
            })
            .unwrap();
        handle.submit(TransferJob::Download("/nope".into())).unwrap();

        match handle.outcomes.recv().await.unwrap() {
            TransferOutcome::Downloaded { file_name, bytes, .. } => {
                assert_eq!(file_name, "motd");
                assert_eq!(bytes, b"hi");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match handle.outcomes.recv().await.unwrap() {
            TransferOutcome::Uploaded { remote, bytes } => {
                assert_eq!(remote, "/tmp/a.txt");
                assert_eq!(bytes, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            handle.outcomes.recv().await.unwrap(),
            TransferOutcome::Failed { op: "download", .. }
        ));

        handle.close().await;
        handle.close().await;
        assert_eq!(*files.closed.lock().unwrap(), 1);
        assert!(staging_is_empty(dir.path()));
        assert!(handle.submit(TransferJob::Download("/etc/motd".into())).is_err());
    }

    #[test]
    fn upload_names_are_reduced_to_basename() {
        let dir = std::env::temp_dir();
        let adapter = FileTransferAdapter::new(MemoryFiles::default(), dir, "/tmp");
        assert_eq!(adapter.upload_path("../../etc/passwd").unwrap(), "/tmp/passwd");
        assert_eq!(adapter.upload_path("tmp_name").unwrap(), "/tmp/tmp_name");
        assert!(adapter.upload_path("dir/").is_err());
        assert!(adapter.upload_path("..").is_err());
    }
}
