//! Secret vault - authenticated encryption of the custodial payload
//!
//! The locked secret is never stored in plaintext. It is sealed with
//! ChaCha20-Poly1305 under a deployment-configured key and opened
//! exactly once, inside the authorized claim.
//!
//! Ciphertext layout: 12-byte random nonce followed by the AEAD output.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use tracing::warn;

use crate::{error::EscrowError, EscrowResult};

const NONCE_LEN: usize = 12;

/// Key used only when no production key is configured. Flagged unsafe;
/// refused outright in production mode.
const DEV_FALLBACK_KEY: [u8; 32] = [0x42; 32];

pub struct SecretVault {
    cipher: ChaCha20Poly1305,
}

impl SecretVault {
    /// Build a vault from the configured hex key.
    ///
    /// Absence of a key is a fatal configuration error in production
    /// mode; in non-production builds a fixed fallback key is used and
    /// loudly logged.
    pub fn from_config(key_hex: Option<&str>, production: bool) -> EscrowResult<Self> {
        let key = match key_hex {
            Some(hex_str) => {
                let bytes = hex::decode(hex_str)
                    .map_err(|e| EscrowError::config(format!("vault key is not hex: {}", e)))?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| {
                    EscrowError::config("vault key must be 32 bytes (64 hex chars)")
                })?;
                key
            }
            None if production => {
                return Err(EscrowError::config(
                    "no vault key configured; refusing to start in production mode",
                ));
            }
            None => {
                warn!("no vault key configured; using UNSAFE development fallback key");
                DEV_FALLBACK_KEY
            }
        };

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| EscrowError::config("invalid vault key length"))?;
        Ok(Self { cipher })
    }

    /// Seal a plaintext secret for storage.
    pub fn seal(&self, plaintext: &str) -> EscrowResult<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EscrowError::crypto("secret encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed secret. Authentication failure (wrong key, tampered
    /// ciphertext) is a crypto error.
    pub fn open(&self, sealed: &[u8]) -> EscrowResult<String> {
        if sealed.len() <= NONCE_LEN {
            return Err(EscrowError::crypto("sealed secret is truncated"));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|_| EscrowError::crypto("secret authentication failed"))?;

        String::from_utf8(plaintext)
            .map_err(|_| EscrowError::crypto("decrypted secret is not valid UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn seal_open_roundtrip() {
        let vault = SecretVault::from_config(Some(TEST_KEY), true).unwrap();
        let sealed = vault.seal("preimage-hex-0123abcd").unwrap();
        assert_ne!(sealed.as_slice(), b"preimage-hex-0123abcd".as_slice());
        assert_eq!(vault.open(&sealed).unwrap(), "preimage-hex-0123abcd");
    }

    #[test]
    fn distinct_nonces_per_seal() {
        let vault = SecretVault::from_config(Some(TEST_KEY), true).unwrap();
        let a = vault.seal("same secret").unwrap();
        let b = vault.seal("same secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let vault = SecretVault::from_config(Some(TEST_KEY), true).unwrap();
        let mut sealed = vault.seal("secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(vault.open(&sealed), Err(EscrowError::Crypto(_))));
    }

    #[test]
    fn wrong_key_fails() {
        let vault = SecretVault::from_config(Some(TEST_KEY), true).unwrap();
        let other = SecretVault::from_config(
            Some("ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
            true,
        )
        .unwrap();
        let sealed = vault.seal("secret").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn missing_key_is_fatal_in_production() {
        assert!(matches!(
            SecretVault::from_config(None, true),
            Err(EscrowError::Config(_))
        ));
    }

    #[test]
    fn missing_key_falls_back_outside_production() {
        let vault = SecretVault::from_config(None, false).unwrap();
        let sealed = vault.seal("dev secret").unwrap();
        assert_eq!(vault.open(&sealed).unwrap(), "dev secret");
    }

    #[test]
    fn malformed_key_rejected() {
        assert!(SecretVault::from_config(Some("not-hex"), false).is_err());
        assert!(SecretVault::from_config(Some("abcd"), false).is_err());
    }
}
