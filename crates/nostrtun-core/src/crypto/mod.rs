//! Cryptographic building blocks for the envelope.
//!
//! - **X25519** key exchange (via the identity keys' Montgomery form)
//! - **HKDF-SHA256** to turn a raw shared point into a cipher key
//! - **ChaCha20-Poly1305** authenticated encryption
//!
//! All primitives come from audited crates; nothing here rolls its
//! own construction.

pub mod aead;
pub mod ephemeral;

pub use ephemeral::{EphemeralPool, DEFAULT_POOL_SIZE};

use crate::error::{Error, Result};
use crate::keys::{Keypair, PublicKey};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of derived cipher keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Domain-separation salt for conversation-key derivation.
const CONVERSATION_SALT: &[u8] = b"nostrtun-conversation-v2";

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Session("key derivation failed".into()))?;
    Ok(output)
}

/// Derive the symmetric conversation key between a local keypair and a
/// remote public key.
///
/// Deterministic in its two inputs and symmetric: the remote side
/// derives the same key from its own keypair and our public key.
pub fn conversation_key(local: &Keypair, remote: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let shared = local.dh(remote)?;
    let derived = hkdf_derive(Some(CONVERSATION_SALT), &*shared, b"conversation-key", KEY_SIZE)?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&derived);
    Ok(key)
}
