//! termrelay-server: browser terminal relay.
//!
//! Accepts WebSocket connections from browser terminals, opens an SSH shell
//! on the requested host (optionally through a proxy hop) and relays the
//! session while recording the commands typed into it.

mod auth;
mod config;
mod relay;
mod server;
mod session;
mod ssh;
mod store;
mod transport;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::ServerConfig;
use server::RelayServer;
use std::path::PathBuf;
use termrelay_core::{create_token, CredentialCipher};
use tracing::{error, info};

/// termrelay-server — browser terminal relay
#[derive(Parser, Debug)]
#[command(name = "termrelay-server", version, about = "Browser terminal to SSH relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.termrelay/config.toml")]
    config: String,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay (default)
    Serve,

    /// Encrypt a host password with the configured credential key
    EncryptPassword {
        /// Plaintext password
        password: String,
    },

    /// Issue an access token for a user
    IssueToken {
        /// Username recorded in the audit trail
        username: String,
        /// Token lifetime in seconds (defaults to security.token_ttl)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(server_config).await,
        Command::EncryptPassword { password } => encrypt_password(&server_config, &password),
        Command::IssueToken { username, ttl } => issue_token(&server_config, &username, ttl),
    };

    if let Err(e) = result {
        error!(error = %e, "termrelay-server failed");
        std::process::exit(1);
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        "starting termrelay-server"
    );

    let relay_server = RelayServer::new(config)
        .await
        .context("failed to create server")?;
    relay_server
        .run(shutdown_signal())
        .await
        .context("server error")?;

    info!("termrelay-server stopped");
    Ok(())
}

fn encrypt_password(config: &ServerConfig, password: &str) -> Result<()> {
    let cipher = CredentialCipher::new(config.require_credential_key()?)?;
    println!("{}", cipher.encrypt(password)?);
    Ok(())
}

fn issue_token(config: &ServerConfig, username: &str, ttl: Option<u64>) -> Result<()> {
    let secret = config
        .token_secret
        .as_deref()
        .context("security.token_secret is not set")?;
    if username.trim().is_empty() {
        anyhow::bail!("username must not be empty");
    }
    println!("{}", create_token(secret, username, ttl.unwrap_or(config.token_ttl)));
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
