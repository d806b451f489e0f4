use thiserror::Error;

/// Errors produced while negotiating and relaying a terminal session.
#[derive(Debug, Error)]
pub enum RelayError {
    /// SSH handshake, authentication, credential or timeout failure.
    #[error("connect error: {0}")]
    Connect(String),

    /// The remote shell channel failed mid-session.
    #[error("channel error: {0}")]
    Channel(String),

    /// SFTP or staging failure during an upload/download.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// A client frame did not match the control schema.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host not found: {0}")]
    HostNotFound(u64),

    #[error("record store error: {0}")]
    Store(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    /// Client-side socket failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unhandled(String),
}

impl RelayError {
    /// Whether this error ends the session when it surfaces inside the relay loop.
    ///
    /// Transfer and decode failures are reported or recovered locally; everything
    /// else tears the session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Transfer(_) | RelayError::Decode(_))
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Connect(_) => "connect",
            RelayError::Channel(_) => "channel",
            RelayError::Transfer(_) => "transfer",
            RelayError::Decode(_) => "decode",
            RelayError::Auth(_) => "auth",
            RelayError::HostNotFound(_) => "host_not_found",
            RelayError::Store(_) => "store",
            RelayError::Crypto(_) => "crypto",
            RelayError::Config(_) => "config",
            RelayError::Transport(_) => "transport",
            RelayError::Io(_) => "io",
            RelayError::Unhandled(_) => "unhandled",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
