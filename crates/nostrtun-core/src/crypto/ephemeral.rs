//! One-time key pool with precomputed conversation keys.
//!
//! Every outgoing gift wrap is signed by, and key-exchanged from, an
//! ephemeral keypair, so the real sender identity never appears on a
//! published event. Generating a keypair and performing the scalar
//! multiplication per packet would dominate the hot path; instead a
//! fixed pool of keypairs is allocated up front and, per recipient,
//! the full array of conversation keys is computed once. After that a
//! wrap costs one atomic increment and one indexed read.
//!
//! Pool-slot reuse across events is safe for confidentiality (the AEAD
//! randomizes per encryption) but links the reusing events to the same
//! outer key, so the pool should be sized well above the expected event
//! volume per recipient.

use crate::crypto::{self, KEY_SIZE};
use crate::error::Result;
use crate::keys::{Keypair, PublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Default number of ephemeral keypairs held by the pool.
pub const DEFAULT_POOL_SIZE: usize = 5_000;

/// A fixed-size pool of one-time keypairs with per-recipient
/// precomputed conversation keys.
pub struct EphemeralPool {
    pairs: Vec<Keypair>,
    cursor: AtomicUsize,
    // recipient -> conversation key per pool slot, in lock-step with `pairs`
    secrets: RwLock<HashMap<PublicKey, Arc<Vec<[u8; KEY_SIZE]>>>>,
}

impl EphemeralPool {
    /// Allocate a pool of `size` fresh keypairs.
    pub fn new(size: usize) -> Self {
        let pairs = (0..size.max(1)).map(|_| Keypair::generate()).collect();
        Self {
            pairs,
            cursor: AtomicUsize::new(0),
            secrets: RwLock::new(HashMap::new()),
        }
    }

    /// Number of keypairs in the pool.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the pool is empty. Never true; pools hold at least one pair.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Take the next keypair, rotating through the pool.
    ///
    /// Thread-safe and uncontested: a single atomic fetch-add.
    pub fn next(&self) -> (usize, &Keypair) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pairs.len();
        (index, &self.pairs[index])
    }

    /// Compute and cache all conversation keys for `recipient`.
    ///
    /// Only the first caller per recipient does the work; concurrent
    /// callers serialize on the write guard and find the cache filled.
    /// For the default pool size this takes a noticeable fraction of a
    /// second, so servers should warm the cache off the packet path.
    pub fn ensure_precomputed(&self, recipient: &PublicKey) -> Result<()> {
        {
            let cache = self.secrets.read().unwrap_or_else(|e| e.into_inner());
            if cache.contains_key(recipient) {
                return Ok(());
            }
        }

        let mut cache = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        if cache.contains_key(recipient) {
            return Ok(());
        }

        let mut keys = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            keys.push(*crypto::conversation_key(pair, recipient)?);
        }
        cache.insert(*recipient, Arc::new(keys));
        Ok(())
    }

    /// The precomputed conversation key for `recipient` at `index`.
    ///
    /// Computes the cache on first use for a recipient; afterwards this
    /// is an O(1) indexed read.
    pub fn conversation_key(&self, recipient: &PublicKey, index: usize) -> Result<[u8; KEY_SIZE]> {
        {
            let cache = self.secrets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(keys) = cache.get(recipient) {
                return Ok(keys[index % keys.len()]);
            }
        }
        self.ensure_precomputed(recipient)?;
        let cache = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        let keys = cache
            .get(recipient)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()));
        if keys.is_empty() {
            return Err(crate::Error::Session("ephemeral cache miss".into()));
        }
        Ok(keys[index % keys.len()])
    }

    /// Number of recipients with a warmed cache.
    pub fn cached_recipients(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl std::fmt::Debug for EphemeralPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralPool")
            .field("size", &self.pairs.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("cached_recipients", &self.cached_recipients())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_wraps_around() {
        let pool = EphemeralPool::new(3);
        let (i0, _) = pool.next();
        let (i1, _) = pool.next();
        let (i2, _) = pool.next();
        let (i3, _) = pool.next();
        assert_eq!((i0, i1, i2, i3), (0, 1, 2, 0));
    }

    #[test]
    fn test_pool_pairs_are_distinct() {
        let pool = EphemeralPool::new(4);
        let (_, a) = pool.next();
        let (_, b) = pool.next();
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_precompute_matches_direct_derivation() {
        let pool = EphemeralPool::new(8);
        let recipient = Keypair::generate();

        pool.ensure_precomputed(&recipient.public()).expect("warm");
        assert_eq!(pool.cached_recipients(), 1);

        let (index, pair) = pool.next();
        let cached = pool
            .conversation_key(&recipient.public(), index)
            .expect("cached key");
        let direct = crypto::conversation_key(pair, &recipient.public()).expect("derive");
        assert_eq!(cached, *direct);
    }

    #[test]
    fn test_recipient_side_derives_same_key() {
        // The recipient only sees the ephemeral public key on the wire
        // and must land on the same conversation key.
        let pool = EphemeralPool::new(2);
        let recipient = Keypair::generate();

        let (index, pair) = pool.next();
        let sender_side = pool
            .conversation_key(&recipient.public(), index)
            .expect("sender key");
        let recipient_side =
            crypto::conversation_key(&recipient, &pair.public()).expect("recipient key");
        assert_eq!(sender_side, *recipient_side);
    }

    #[test]
    fn test_lazy_cache_allocation() {
        let pool = EphemeralPool::new(2);
        assert_eq!(pool.cached_recipients(), 0);

        let recipient = Keypair::generate();
        pool.conversation_key(&recipient.public(), 0)
            .expect("lazy warm");
        assert_eq!(pool.cached_recipients(), 1);

        // Second recipient gets its own array.
        let other = Keypair::generate();
        pool.conversation_key(&other.public(), 1).expect("warm");
        assert_eq!(pool.cached_recipients(), 2);
    }
}
