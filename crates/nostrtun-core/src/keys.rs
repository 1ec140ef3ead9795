//! Long-term identity key material.
//!
//! An identity is a 32-byte ed25519 secret scalar and its derived
//! public key. The same keypair signs events and, converted to its
//! Montgomery form, performs the Diffie-Hellman exchanges that key the
//! envelope encryption. Either half may be rendered as lowercase hex or
//! as a checksummed bech32 string (`nsec...` for secrets, `npub...` for
//! public keys) for humans to copy around.
//!
//! Secret key material is never logged and is zeroized on drop.

use crate::error::{Error, Result};
use crate::logging::Redacted;
use bech32::{FromBase32, ToBase32, Variant};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Size of keys in bytes.
pub const KEY_SIZE: usize = 32;

/// Human-readable prefix for bech32 secret keys.
pub const SECRET_KEY_HRP: &str = "nsec";

/// Human-readable prefix for bech32 public keys.
pub const PUBLIC_KEY_HRP: &str = "npub";

/// A validated identity public key.
///
/// Always a canonical ed25519 point; parsing rejects anything else.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Parse from 64-char hex or an `npub...` bech32 string.
    pub fn parse(input: &str) -> Result<Self> {
        let bytes = decode_key_string(input, PUBLIC_KEY_HRP)?;
        Self::from_bytes(bytes)
    }

    /// Construct from raw bytes, validating the curve point.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Result<Self> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| Error::BadKeyFormat("not a valid public key point".into()))?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bech32 rendering with the `npub` prefix.
    pub fn to_bech32(&self) -> String {
        encode_key_string(PUBLIC_KEY_HRP, &self.0)
    }

    /// The ed25519 verifying key for signature checks.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| Error::BadSignature)
    }

    /// The equivalent Montgomery-form (X25519) public key bytes.
    pub(crate) fn montgomery_bytes(&self) -> Result<[u8; KEY_SIZE]> {
        Ok(self.verifying_key()?.to_montgomery().to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_hex()[..8])
    }
}

/// A long-term identity keypair.
pub struct Keypair {
    signing: SigningKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh identity from the OS random source.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Restore from a secret given as 64-char hex or an `nsec...` string.
    pub fn from_secret(input: &str) -> Result<Self> {
        let bytes = decode_key_string(input, SECRET_KEY_HRP)?;
        Ok(Self::from_secret_bytes(bytes))
    }

    /// Restore from raw secret bytes.
    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let signing = SigningKey::from_bytes(&bytes);
        let public = PublicKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// This identity's public key.
    pub fn public(&self) -> PublicKey {
        self.public
    }

    /// Bech32 rendering of the secret with the `nsec` prefix.
    ///
    /// Handle with care; never log the result.
    pub fn secret_bech32(&self) -> Zeroizing<String> {
        Zeroizing::new(encode_key_string(SECRET_KEY_HRP, &self.signing.to_bytes()))
    }

    /// Export secret bytes.
    ///
    /// Handle with care; never log the result.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Raw X25519 Diffie-Hellman with a peer public key.
    ///
    /// Symmetric: `a.dh(B) == b.dh(A)`. The result feeds the key
    /// derivation in [`crate::crypto`]; it is not used as a cipher key
    /// directly.
    pub fn dh(&self, their: &PublicKey) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        let scalar = self.signing.to_scalar_bytes();
        Ok(Zeroizing::new(x25519_dalek::x25519(
            scalar,
            their.montgomery_bytes()?,
        )))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .field("secret", &Redacted("ed25519 secret"))
            .finish()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(&self.signing.to_bytes()),
            public: self.public,
        }
    }
}

/// Decode a key string given as hex or bech32 with the expected prefix.
fn decode_key_string(input: &str, expected_hrp: &str) -> Result<[u8; KEY_SIZE]> {
    let input = input.trim();

    if input.len() == KEY_SIZE * 2 && input.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(input, &mut bytes)
            .map_err(|_| Error::BadKeyFormat("invalid hex".into()))?;
        return Ok(bytes);
    }

    let (hrp, data, variant) =
        bech32::decode(input).map_err(|_| Error::BadKeyFormat("not hex or bech32".into()))?;
    if variant != Variant::Bech32 {
        return Err(Error::BadKeyFormat("wrong bech32 variant".into()));
    }
    if hrp != expected_hrp {
        return Err(Error::BadKeyFormat(format!(
            "expected {} prefix, got {}",
            expected_hrp, hrp
        )));
    }
    let raw = Vec::<u8>::from_base32(&data)
        .map_err(|_| Error::BadKeyFormat("invalid bech32 payload".into()))?;
    raw.try_into()
        .map_err(|_| Error::BadKeyFormat("decoded key must be 32 bytes".into()))
}

fn encode_key_string(hrp: &str, bytes: &[u8; KEY_SIZE]) -> String {
    // The hrp and length are fixed, so encoding cannot fail.
    bech32::encode(hrp, bytes.to_base32(), Variant::Bech32).unwrap_or_default()
}
