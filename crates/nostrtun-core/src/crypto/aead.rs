//! Authenticated encryption for envelope payloads.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce prepended to the
//! ciphertext. Every call draws a fresh nonce, so encrypting the same
//! plaintext twice under the same key yields unrelated ciphertexts.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of the cipher key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Encrypt plaintext under `key` with a fresh random nonce.
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::Session("encryption failed".into()))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data produced by [`encrypt`].
///
/// Fails with [`Error::DecryptError`] when the key is wrong or the
/// data was tampered with. The error carries no detail, so a receiver
/// cannot be used as a decryption oracle.
pub fn decrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::DecryptError);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    let plaintext = cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| Error::DecryptError)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"tunnel bytes";

        let sealed = encrypt(&key, plaintext).expect("encrypt");
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let opened = decrypt(&key, &sealed).expect("decrypt");
        assert_eq!(&*opened, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&[1u8; KEY_SIZE], b"secret").expect("encrypt");
        assert!(matches!(
            decrypt(&[2u8; KEY_SIZE], &sealed),
            Err(Error::DecryptError)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let mut sealed = encrypt(&key, b"secret").expect("encrypt");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(matches!(decrypt(&key, &sealed), Err(Error::DecryptError)));
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = [42u8; KEY_SIZE];
        assert!(matches!(
            decrypt(&key, &[0u8; NONCE_SIZE]),
            Err(Error::DecryptError)
        ));
    }

    #[test]
    fn test_nonce_randomized() {
        let key = [42u8; KEY_SIZE];
        let a = encrypt(&key, b"same plaintext").expect("encrypt");
        let b = encrypt(&key, b"same plaintext").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_SIZE];
        let sealed = encrypt(&key, b"").expect("encrypt");
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        let opened = decrypt(&key, &sealed).expect("decrypt");
        assert!(opened.is_empty());
    }
}
