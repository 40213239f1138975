//! Frame payload encryption.
//!
//! Every payload crossing the relay is sealed with XChaCha20-Poly1305
//! under the key derived from the share secret. The 24-byte random
//! nonce is appended to the ciphertext, so a sealed frame is
//! `ciphertext ‖ tag ‖ nonce`. The relay forwards these bytes without
//! being able to read or forge them.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::access::{derive_payload_key, Secret};

/// Nonce length appended to every sealed frame.
pub const NONCE_LEN: usize = 24;

/// Errors sealing or opening a frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CipherError {
    /// Sealing failed (should not happen with a well-formed key).
    Seal(String),
    /// Frame shorter than a nonce + tag; cannot possibly open.
    TooShort { len: usize },
    /// Authentication failed: tampered frame, or a different secret.
    Open,
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::Seal(e) => write!(f, "Seal failed: {e}"),
            CipherError::TooShort { len } => write!(f, "Sealed frame too short: {len} bytes"),
            CipherError::Open => write!(f, "Decryption failed"),
        }
    }
}

impl std::error::Error for CipherError {}

/// Symmetric AEAD over frame payloads.
pub struct PayloadCipher {
    cipher: XChaCha20Poly1305,
}

impl PayloadCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Build the cipher for a share secret.
    pub fn from_secret(secret: &Secret) -> Self {
        Self::new(&derive_payload_key(secret))
    }

    /// Seal a plaintext payload; the fresh random nonce is appended.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CipherError::Seal(e.to_string()))?;
        sealed.extend_from_slice(nonce.as_slice());
        Ok(sealed)
    }

    /// Open a sealed payload created by [`PayloadCipher::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() <= NONCE_LEN {
            return Err(CipherError::TooShort { len: sealed.len() });
        }
        let (ciphertext, nonce) = sealed.split_at(sealed.len() - NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> PayloadCipher {
        PayloadCipher::from_secret(&Secret::generate())
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = test_cipher();
        let msg = b"the accountant met the director on the 14th".to_vec();
        let sealed = cipher.seal(&msg).unwrap();
        assert_ne!(sealed, msg);
        assert_eq!(cipher.open(&sealed).unwrap(), msg);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = test_cipher();
        let a = cipher.seal(b"same plaintext").unwrap();
        let b = cipher.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"payload").unwrap();
        sealed[0] ^= 0x01;
        assert_eq!(cipher.open(&sealed), Err(CipherError::Open));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = test_cipher().seal(b"payload").unwrap();
        let other = test_cipher();
        assert_eq!(other.open(&sealed), Err(CipherError::Open));
    }

    #[test]
    fn test_short_frame_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.open(&[0u8; 8]),
            Err(CipherError::TooShort { len: 8 })
        ));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), Vec::<u8>::new());
    }
}
