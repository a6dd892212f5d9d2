//! AES-256-GCM envelope
//!
//! Wire format: `nonce (12 bytes) || gcm_seal(plaintext)`. The nonce is
//! fresh per seal; the GCM tag trails the ciphertext.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use shardstore_common::{Error, Result};

use crate::provider::KeyMaterial;

/// Nonce length (96-bit)
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Fixed size overhead of a sealed envelope over its plaintext
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Seal plaintext under the given key with a fresh nonce
pub fn seal(plaintext: &[u8], key: &KeyMaterial) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Internal("AES-GCM seal failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed envelope
///
/// Fails with `IntegrityFailure` when the authentication tag does not
/// verify, i.e. the ciphertext was tampered with or the key is wrong.
pub fn open(sealed: &[u8], key: &KeyMaterial) -> Result<Vec<u8>> {
    if sealed.len() < ENVELOPE_OVERHEAD {
        return Err(Error::IntegrityFailure(format!(
            "envelope too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::IntegrityFailure("AES-GCM authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = KeyMaterial::generate();
        let plaintext = b"hello world";

        let sealed = seal(plaintext, &key).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + ENVELOPE_OVERHEAD);

        let opened = open(&sealed, &key).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let key = KeyMaterial::generate();
        let a = seal(b"same input", &key).unwrap();
        let b = seal(b"same input", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detected() {
        let key = KeyMaterial::generate();
        let mut sealed = seal(b"hello world", &key).unwrap();

        sealed[NONCE_LEN + 2] ^= 0x01;
        assert!(matches!(
            open(&sealed, &key),
            Err(shardstore_common::Error::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_wrong_key_detected() {
        let sealed = seal(b"hello world", &KeyMaterial::generate()).unwrap();
        assert!(open(&sealed, &KeyMaterial::generate()).is_err());
    }

    #[test]
    fn test_truncated_envelope() {
        let key = KeyMaterial::generate();
        assert!(open(&[0u8; 8], &key).is_err());
    }
}
