//! Caller authentication for incoming terminal connections.

use async_trait::async_trait;
use termrelay_core::{verify_token, RelayError, RelayResult};

/// Resolves an access token to the acting username.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> RelayResult<String>;
}

/// Verifies HMAC access tokens issued by `termrelay-server issue-token`.
pub struct TokenAuthenticator {
    secret: Vec<u8>,
}

impl TokenAuthenticator {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn verify(&self, token: &str) -> RelayResult<String> {
        if token.is_empty() {
            return Err(RelayError::Auth("missing token".into()));
        }
        verify_token(&self.secret, token)
    }
}
