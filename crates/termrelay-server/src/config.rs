//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termrelay_core::{RelayError, RelayResult};
use tracing::{info, warn};

use crate::store::NewHost;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub sftp: SftpSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// `[ssh]` section: outbound SSH behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u32,
    #[serde(default = "default_rows")]
    pub rows: u32,
    /// Route every host without its own proxy through `unit_proxy_ip`.
    #[serde(default)]
    pub unit_proxy: bool,
    #[serde(default)]
    pub unit_proxy_ip: Option<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            unit_proxy: false,
            unit_proxy_ip: None,
        }
    }
}

/// `[sftp]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SftpSection {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default)]
    pub staging_dir: Option<String>,
}

impl Default for SftpSection {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            staging_dir: None,
        }
    }
}

/// `[security]` section. Keys are hex encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySection {
    #[serde(default)]
    pub credential_key: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            credential_key: None,
            token_secret: None,
            token_ttl: default_token_ttl(),
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSection {
    #[serde(default)]
    pub journal: Option<String>,
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
    pub external_ip: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_login_user")]
    pub login_user: String,
    /// Ciphertext produced by `termrelay-server encrypt-password`.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub proxy_ips: String,
}

impl From<HostEntry> for NewHost {
    fn from(entry: HostEntry) -> Self {
        NewHost {
            id: entry.id,
            name: entry.name,
            external_ip: entry.external_ip,
            port: entry.port,
            login_user: entry.login_user,
            password: entry.password,
            proxy_ips: entry.proxy_ips,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8022
}
fn default_max_frame_size() -> usize {
    1_048_576
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive_interval() -> u64 {
    30
}
fn default_keepalive_max() -> usize {
    3
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_cols() -> u32 {
    188
}
fn default_rows() -> u32 {
    49
}
fn default_upload_dir() -> String {
    "/tmp".to_string()
}
fn default_token_ttl() -> u64 {
    86400
}
fn default_ssh_port() -> u16 {
    22
}
fn default_login_user() -> String {
    "root".to_string()
}

/// Outbound SSH settings handed to the negotiator.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_max: usize,
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_frame_size: usize,
    pub ssh: SshSettings,
    /// Unit-wide default proxy, only set when `unit_proxy` is enabled.
    pub unit_proxy_ip: Option<String>,
    pub upload_dir: String,
    pub staging_dir: PathBuf,
    pub credential_key: Option<Vec<u8>>,
    pub token_secret: Option<Vec<u8>>,
    pub token_ttl: u64,
    pub journal_path: Option<PathBuf>,
    pub hosts: Vec<HostEntry>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli_bind, cli_port)
    }

    fn resolve(
        file: ConfigFile,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> RelayResult<Self> {
        let bind = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file.server.bind);
        let port = cli_port.unwrap_or(file.server.port);

        let unit_proxy_ip = match (file.ssh.unit_proxy, file.ssh.unit_proxy_ip) {
            (true, Some(ip)) if !ip.trim().is_empty() => Some(ip.trim().to_string()),
            (true, _) => {
                warn!("ssh.unit_proxy is enabled but ssh.unit_proxy_ip is empty; ignoring");
                None
            }
            (false, _) => None,
        };

        let staging_dir = file
            .sftp
            .staging_dir
            .as_deref()
            .map(expand_tilde_str)
            .unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            bind,
            port,
            max_frame_size: file.server.max_frame_size,
            ssh: SshSettings {
                connect_timeout: Duration::from_secs(file.ssh.connect_timeout),
                keepalive_interval: Duration::from_secs(file.ssh.keepalive_interval),
                keepalive_max: file.ssh.keepalive_max,
                term: file.ssh.term,
                cols: file.ssh.cols,
                rows: file.ssh.rows,
            },
            unit_proxy_ip,
            upload_dir: file.sftp.upload_dir.trim_end_matches('/').to_string(),
            staging_dir,
            credential_key: decode_key("security.credential_key", file.security.credential_key)?,
            token_secret: decode_key("security.token_secret", file.security.token_secret)?,
            token_ttl: file.security.token_ttl,
            journal_path: file.audit.journal.as_deref().map(expand_tilde_str),
            hosts: file.hosts,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// The credential key, required for anything that touches host passwords.
    pub fn require_credential_key(&self) -> RelayResult<&[u8]> {
        self.credential_key
            .as_deref()
            .ok_or_else(|| RelayError::Config("security.credential_key is not set".into()))
    }
}

fn parse(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

fn decode_key(field: &str, value: Option<String>) -> RelayResult<Option<Vec<u8>>> {
    match value {
        Some(hex_str) if !hex_str.trim().is_empty() => hex::decode(hex_str.trim())
            .map(Some)
            .map_err(|e| RelayError::Config(format!("{field} is not valid hex: {e}"))),
        _ => Ok(None),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let cfg = ServerConfig::resolve(parse("").unwrap(), None, None).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8022");
        assert_eq!(cfg.max_frame_size, 1_048_576);
        assert_eq!(cfg.ssh.term, "xterm-256color");
        assert_eq!((cfg.ssh.cols, cfg.ssh.rows), (188, 49));
        assert_eq!(cfg.ssh.keepalive_interval, Duration::from_secs(30));
        assert_eq!(cfg.upload_dir, "/tmp");
        assert!(cfg.unit_proxy_ip.is_none());
        assert!(cfg.require_credential_key().is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse("[server]\nbind = \"127.0.0.1\"\nport = 9000\n").unwrap();
        let cfg = ServerConfig::resolve(file, Some("::1"), Some(9100)).unwrap();
        assert_eq!(cfg.bind, "::1");
        assert_eq!(cfg.port, 9100);
    }

    #[test]
    fn unit_proxy_requires_flag() {
        let file = parse("[ssh]\nunit_proxy_ip = \"10.0.0.9\"\n").unwrap();
        let cfg = ServerConfig::resolve(file, None, None).unwrap();
        assert!(cfg.unit_proxy_ip.is_none());

        let file = parse("[ssh]\nunit_proxy = true\nunit_proxy_ip = \"10.0.0.9\"\n").unwrap();
        let cfg = ServerConfig::resolve(file, None, None).unwrap();
        assert_eq!(cfg.unit_proxy_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn hosts_and_keys() {
        let toml = r#"
            [security]
            credential_key = "0001020304050607080900010203040506070809000102030405060708090001"

            [[hosts]]
            id = 3
            name = "web-1"
            external_ip = "192.168.1.10"
            password = "abc"
            proxy_ips = "10.0.0.1,10.0.0.2"
        "#;
        let cfg = ServerConfig::resolve(parse(toml).unwrap(), None, None).unwrap();
        assert_eq!(cfg.require_credential_key().unwrap().len(), 32);
        let host = &cfg.hosts[0];
        assert_eq!(host.port, 22);
        assert_eq!(host.login_user, "root");
        assert_eq!(host.proxy_ips, "10.0.0.1,10.0.0.2");
    }

    #[test]
    fn bad_hex_is_config_error() {
        let file = parse("[security]\ntoken_secret = \"zz\"\n").unwrap();
        assert!(matches!(
            ServerConfig::resolve(file, None, None),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn tilde_expands() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs"), PathBuf::from("/abs"));
    }
}
