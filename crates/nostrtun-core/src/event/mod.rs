//! Relay event model.
//!
//! Events are the unit the relay protocol stores and forwards: a JSON
//! record with a numeric kind, a content string, a tag list, a
//! timestamp, an author public key, a content-addressed id and a
//! signature. The id is the SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`; the signature is
//! ed25519 over the id bytes.
//!
//! Rumors are events that never get a signature and never travel in
//! the clear; see [`envelope`].

pub mod envelope;

use crate::error::{Error, Result};
use crate::keys::{Keypair, PublicKey};
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// A relay event, signed or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Hex author public key.
    pub pubkey: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Numeric event kind.
    pub kind: u32,
    /// Two-or-more-element string arrays.
    pub tags: Vec<Vec<String>>,
    /// Content string; meaning depends on the kind.
    pub content: String,
    /// Hex ed25519 signature over the id bytes; empty on rumors.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sig: String,
}

impl Event {
    /// Assemble an event with its id computed and no signature.
    pub fn build(
        kind: u32,
        content: String,
        tags: Vec<Vec<String>>,
        author: &PublicKey,
        created_at: u64,
    ) -> Result<Self> {
        let mut event = Self {
            id: String::new(),
            pubkey: author.to_hex(),
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        };
        event.id = event.compute_id()?;
        Ok(event)
    }

    /// The canonical id: SHA-256 over
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> Result<String> {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        let serialized = serde_json::to_string(&canonical)
            .map_err(|_| Error::Session("event serialization failed".into()))?;
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Sign this event's id with `keypair`.
    ///
    /// The keypair must be the declared author; relays check both the
    /// hash and the signature.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<()> {
        let id_bytes = self.id_bytes()?;
        self.sig = hex::encode(keypair.sign(&id_bytes).to_bytes());
        Ok(())
    }

    /// Verify the id recomputes and the signature checks out against
    /// the declared author.
    pub fn verify(&self) -> Result<()> {
        if self.compute_id()? != self.id {
            return Err(Error::BadSignature);
        }

        let author = self.author()?;
        let sig_bytes: [u8; 64] = hex::decode(&self.sig)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(Error::BadSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);

        author
            .verifying_key()?
            .verify(&self.id_bytes()?, &signature)
            .map_err(|_| Error::BadSignature)
    }

    /// The declared author as a validated public key.
    pub fn author(&self) -> Result<PublicKey> {
        let bytes: [u8; 32] = hex::decode(&self.pubkey)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| Error::BadKeyFormat("event pubkey is not 32 hex bytes".into()))?;
        PublicKey::from_bytes(bytes)
    }

    /// First value of the tag named `name`, if present.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    fn id_bytes(&self) -> Result<[u8; 32]> {
        hex::decode(&self.id)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(Error::BadSignature)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
