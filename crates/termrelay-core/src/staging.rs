//! Local staging file naming for SFTP transfers.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Final path segment of a remote path.
pub fn file_name(remote_path: &str) -> &str {
    remote_path.rsplit('/').next().unwrap_or(remote_path)
}

/// A unique local name for staging `remote_path`: a salted SHA-256 of the
/// path, keeping the original extension if there is one.
pub fn staging_file_name(remote_path: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let salt: u64 = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(remote_path.as_bytes());
    hasher.update(nanos.to_be_bytes());
    hasher.update(salt.to_be_bytes());
    let digest = hex::encode(hasher.finalize());

    match Path::new(file_name(remote_path)).extension() {
        Some(ext) => format!("{digest}.{}", ext.to_string_lossy()),
        None => digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_last_segment() {
        assert_eq!(file_name("/var/log/syslog"), "syslog");
        assert_eq!(file_name("notes.txt"), "notes.txt");
        assert_eq!(file_name("/tmp/dir/"), "");
    }

    #[test]
    fn keeps_extension() {
        let name = staging_file_name("/etc/nginx/nginx.conf");
        assert!(name.ends_with(".conf"));
        assert_eq!(name.len(), 64 + ".conf".len());
    }

    #[test]
    fn no_extension_is_bare_digest() {
        let name = staging_file_name("/etc/hosts");
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn unique_per_transfer() {
        assert_ne!(staging_file_name("/a/b.txt"), staging_file_name("/a/b.txt"));
    }
}
