//! HMAC access tokens for termrelay.
//!
//! A token binds a username to an expiry time and is signed with a server
//! secret. Format: base64url (no padding) of
//! `[8-byte expiry][32-byte HMAC-SHA256][username bytes]`.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;

use crate::error::{RelayError, RelayResult};

const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn signed_data(expiry: u64, username: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + username.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(username.as_bytes());
    data
}

/// Create an access token for `username` valid for `ttl_secs`.
pub fn create_token(secret: &[u8], username: &str, ttl_secs: u64) -> String {
    create_token_at(secret, username, now_secs().saturating_add(ttl_secs))
}

fn create_token_at(secret: &[u8], username: &str, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, username));

    let mut token = Vec::with_capacity(EXPIRY_LEN + TAG_LEN + username.len());
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    token.extend_from_slice(username.as_bytes());
    URL_SAFE_NO_PAD.encode(token)
}

/// Verify an access token and return the username it was issued to.
///
/// Checks both the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], token: &str) -> RelayResult<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| RelayError::Auth("malformed token".into()))?;
    if raw.len() <= EXPIRY_LEN + TAG_LEN {
        return Err(RelayError::Auth(format!(
            "invalid token length: {}",
            raw.len()
        )));
    }

    let (expiry_bytes, rest) = raw.split_at(EXPIRY_LEN);
    let (tag, user_bytes) = rest.split_at(TAG_LEN);
    let mut expiry_buf = [0u8; EXPIRY_LEN];
    expiry_buf.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry_buf);

    let username = std::str::from_utf8(user_bytes)
        .map_err(|_| RelayError::Auth("token username is not UTF-8".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, username), tag)
        .map_err(|_| RelayError::Auth("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(RelayError::Auth("token expired".into()));
    }
    Ok(username.to_string())
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> RelayResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| RelayError::Crypto("RNG failure".into()))?;
    Ok(secret)
}
