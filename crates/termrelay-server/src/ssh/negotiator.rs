//! Resolves a target host (and optional proxy hop) and opens the SSH
//! transport plus an interactive PTY channel.

use russh::client::{self, AuthResult, Handle, Msg};
use russh::{Channel, ChannelMsg};
use std::future::Future;
use std::sync::Arc;
use termrelay_core::{CredentialCipher, RelayError, RelayResult};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::transport::{RelayClientHandler, SshTransport};
use crate::config::SshSettings;
use crate::session::SessionTransport;
use crate::store::{proxy_ip_list, Host, RecordStore};

/// Where a proxy IP came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyChoice {
    /// The host's own proxy list; the last entry wins.
    Configured(String),
    /// The unit-wide default proxy.
    UnitDefault(String),
}

impl ProxyChoice {
    pub fn ip(&self) -> &str {
        match self {
            ProxyChoice::Configured(ip) | ProxyChoice::UnitDefault(ip) => ip,
        }
    }
}

/// Pick the proxy IP for `host`, if any.
pub fn select_proxy_ip(host: &Host, unit_proxy_ip: Option<&str>) -> Option<ProxyChoice> {
    if let Some(last) = proxy_ip_list(&host.proxy_ips).last() {
        return Some(ProxyChoice::Configured(last.to_string()));
    }
    unit_proxy_ip
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(|ip| ProxyChoice::UnitDefault(ip.to_string()))
}

/// An established SSH session ready for relaying.
pub struct NegotiatedSession {
    pub host: Host,
    pub proxy: Option<Host>,
    pub transport: Arc<SshTransport>,
    pub channel: Channel<Msg>,
    /// Output the shell produced before relaying started.
    pub banner: Vec<u8>,
}

pub struct Negotiator {
    settings: SshSettings,
    cipher: Arc<CredentialCipher>,
    store: Arc<dyn RecordStore>,
    unit_proxy_ip: Option<String>,
}

impl Negotiator {
    pub fn new(
        settings: SshSettings,
        cipher: Arc<CredentialCipher>,
        store: Arc<dyn RecordStore>,
        unit_proxy_ip: Option<String>,
    ) -> Self {
        Self {
            settings,
            cipher,
            store,
            unit_proxy_ip,
        }
    }

    /// Look up the target host and its proxy hop. A proxy address that
    /// matches no registered host falls back to a direct connection.
    pub async fn resolve(&self, host_id: u64) -> RelayResult<(Host, Option<Host>)> {
        let host = self
            .store
            .get_host(host_id)
            .await?
            .ok_or(RelayError::HostNotFound(host_id))?;

        let proxy = match select_proxy_ip(&host, self.unit_proxy_ip.as_deref()) {
            None => None,
            Some(ProxyChoice::Configured(ip)) => {
                let candidates = self.store.list_proxy_candidates(&host).await?;
                let proxy = candidates
                    .into_iter()
                    .find(|candidate| candidate.external_ip == ip);
                if proxy.is_none() {
                    warn!(host_id, proxy = %ip, "proxy is not a registered host, connecting directly");
                }
                proxy
            }
            Some(ProxyChoice::UnitDefault(ip)) => {
                let proxy = self.store.find_host_by_ip(&ip).await?;
                if proxy.is_none() {
                    warn!(host_id, proxy = %ip, "unit proxy is not a registered host, connecting directly");
                }
                proxy
            }
        };
        Ok((host, proxy))
    }

    /// Connect to `host_id` and start an interactive shell.
    pub async fn negotiate(&self, host_id: u64, session_id: &str) -> RelayResult<NegotiatedSession> {
        let (host, proxy) = self.resolve(host_id).await?;
        let config = Arc::new(self.client_config());

        let transport = match &proxy {
            Some(proxy_host) => {
                info!(
                    session_id,
                    host = %host.external_ip,
                    proxy = %proxy_host.external_ip,
                    "connecting through proxy"
                );
                let proxy_handle = self
                    .with_timeout(&proxy_host.external_ip, async {
                        let mut handle = client::connect(
                            config.clone(),
                            (proxy_host.external_ip.as_str(), proxy_host.port),
                            RelayClientHandler::new(&proxy_host.external_ip),
                        )
                        .await
                        .map_err(|e| connect_error(proxy_host, e))?;
                        self.authenticate(&mut handle, proxy_host).await?;
                        Ok::<_, RelayError>(handle)
                    })
                    .await?;

                let target_handle = self
                    .with_timeout(&host.external_ip, async {
                        let tunnel = proxy_handle
                            .channel_open_direct_tcpip(
                                host.external_ip.clone(),
                                u32::from(host.port),
                                proxy_host.external_ip.clone(),
                                u32::from(proxy_host.port),
                            )
                            .await
                            .map_err(|e| {
                                RelayError::Connect(format!(
                                    "direct-tcpip to {}:{} via {} failed: {e}",
                                    host.external_ip, host.port, proxy_host.external_ip
                                ))
                            })?;
                        let mut handle = client::connect_stream(
                            config.clone(),
                            tunnel.into_stream(),
                            RelayClientHandler::new(&host.external_ip),
                        )
                        .await
                        .map_err(|e| connect_error(&host, e))?;
                        self.authenticate(&mut handle, &host).await?;
                        Ok::<_, RelayError>(handle)
                    })
                    .await?;

                SshTransport::new(host.external_ip.clone(), target_handle, Some(proxy_handle))
            }
            None => {
                info!(session_id, host = %host.external_ip, "connecting directly");
                let handle = self
                    .with_timeout(&host.external_ip, async {
                        let mut handle = client::connect(
                            config.clone(),
                            (host.external_ip.as_str(), host.port),
                            RelayClientHandler::new(&host.external_ip),
                        )
                        .await
                        .map_err(|e| connect_error(&host, e))?;
                        self.authenticate(&mut handle, &host).await?;
                        Ok::<_, RelayError>(handle)
                    })
                    .await?;
                SshTransport::new(host.external_ip.clone(), handle, None)
            }
        };
        let transport = Arc::new(transport);

        let (channel, banner) = match self.open_shell(&transport).await {
            Ok(shell) => shell,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };

        info!(
            session_id,
            host = %host.external_ip,
            banner_bytes = banner.len(),
            "ssh session established"
        );
        Ok(NegotiatedSession {
            host,
            proxy,
            transport,
            channel,
            banner,
        })
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            keepalive_interval: Some(self.settings.keepalive_interval),
            keepalive_max: self.settings.keepalive_max,
            inactivity_timeout: None,
            ..Default::default()
        }
    }

    async fn with_timeout<T>(
        &self,
        ip: &str,
        step: impl Future<Output = RelayResult<T>>,
    ) -> RelayResult<T> {
        timeout(self.settings.connect_timeout, step)
            .await
            .map_err(|_| {
                RelayError::Connect(format!(
                    "connection to {ip} timed out after {}s",
                    self.settings.connect_timeout.as_secs()
                ))
            })?
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<RelayClientHandler>,
        host: &Host,
    ) -> RelayResult<()> {
        let password = self.cipher.decrypt(&host.password).map_err(|e| {
            RelayError::Connect(format!("cannot decrypt password for {}: {e}", host.external_ip))
        })?;
        let result = handle
            .authenticate_password(host.login_user.clone(), password)
            .await
            .map_err(|e| connect_error(host, e))?;
        match result {
            AuthResult::Success => {
                debug!(host = %host.external_ip, user = %host.login_user, "ssh authentication succeeded");
                Ok(())
            }
            AuthResult::Failure { .. } => Err(RelayError::Connect(format!(
                "authentication rejected for {}@{}",
                host.login_user, host.external_ip
            ))),
        }
    }

    async fn open_shell(&self, transport: &SshTransport) -> RelayResult<(Channel<Msg>, Vec<u8>)> {
        let mut channel = transport
            .open_session_channel()
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        self.start_shell(&channel).await?;
        let banner = self.read_banner(&mut channel).await?;
        Ok((channel, banner))
    }

    async fn start_shell(&self, channel: &Channel<Msg>) -> RelayResult<()> {
        channel
            .request_pty(
                false,
                &self.settings.term,
                self.settings.cols,
                self.settings.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| RelayError::Connect(format!("pty request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| RelayError::Connect(format!("shell request failed: {e}")))
    }

    /// Wait for the first output of the shell. A shell that stays silent for
    /// the whole connect timeout yields an empty banner.
    async fn read_banner(&self, channel: &mut Channel<Msg>) -> RelayResult<Vec<u8>> {
        let first = timeout(self.settings.connect_timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => return Ok(data.to_vec()),
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        return Err(RelayError::Connect(
                            "shell closed before producing output".into(),
                        ))
                    }
                    Some(_) => {}
                }
            }
        })
        .await;

        match first {
            Ok(result) => result,
            Err(_) => Ok(Vec::new()),
        }
    }
}

fn connect_error(host: &Host, e: russh::Error) -> RelayError {
    RelayError::Connect(format!("{}:{}: {e}", host.external_ip, host.port))
}
