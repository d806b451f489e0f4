//! At-rest encryption for host login passwords.
//!
//! AES-256-GCM with a random 96-bit nonce per value. The stored form is
//! standard base64 of `nonce || ciphertext || tag`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{RelayError, RelayResult};

pub const KEY_LEN: usize = 32;

pub struct CredentialCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl CredentialCipher {
    /// Build a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> RelayResult<Self> {
        if key.len() != KEY_LEN {
            return Err(RelayError::Crypto(format!(
                "credential key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&aead::AES_256_GCM, key)
            .map_err(|_| RelayError::Crypto("invalid credential key".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> RelayResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| RelayError::Crypto("RNG failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| RelayError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> RelayResult<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| RelayError::Crypto(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN + aead::AES_256_GCM.tag_len() {
            return Err(RelayError::Crypto("ciphertext too short".into()));
        }

        let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| RelayError::Crypto("invalid nonce".into()))?;
        let mut in_out = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| RelayError::Crypto("decryption failed".into()))?;

        String::from_utf8(plain.to_vec())
            .map_err(|_| RelayError::Crypto("decrypted value is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt() {
        let c = cipher();
        let sealed = c.encrypt("s3cret!").unwrap();
        assert_ne!(sealed, "s3cret!");
        assert_eq!(c.decrypt(&sealed).unwrap(), "s3cret!");
    }

    #[test]
    fn nonces_differ_per_value() {
        let c = cipher();
        assert_ne!(c.encrypt("same").unwrap(), c.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = cipher().encrypt("pw").unwrap();
        let other = CredentialCipher::new(&[8u8; KEY_LEN]).unwrap();
        assert!(matches!(other.decrypt(&sealed), Err(RelayError::Crypto(_))));
    }

    #[test]
    fn garbage_input_fails() {
        let c = cipher();
        assert!(c.decrypt("not base64 !!").is_err());
        assert!(c.decrypt("AAAA").is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(CredentialCipher::new(&[0u8; 16]).is_err());
    }
}
