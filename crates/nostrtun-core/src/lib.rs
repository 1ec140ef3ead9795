//! # nostrtun core library
//!
//! Tunnels arbitrary TCP byte streams across untrusted Nostr-style
//! relays. An ingress endpoint accepts local TCP connections and turns
//! their bytes into signed, end-to-end-encrypted events; an egress
//! endpoint receives those events, dials a configured target and pipes
//! the bytes through. Relays only ever see one-time sender keys and
//! opaque ciphertext.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │            tunnel (ingress/egress)         │
//! ├────────────────────────────────────────────┤
//! │    session     │         relay pool        │
//! ├────────────────────────────────────────────┤
//! │        event (rumor / seal / gift wrap)    │
//! ├────────────────────────────────────────────┤
//! │      crypto      │          keys           │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees (and non-guarantees)
//!
//! - Per-session, per-direction ordered byte delivery after reordering.
//! - End-to-end confidentiality and integrity; relays learn only the
//!   recipient public key and event timing.
//! - One-time outer sender keys: the real sender identity never tags a
//!   published event.
//! - No retransmission, no ACKs, no flow control: a lost event stalls
//!   its session until the TCP peers give up.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod crypto;
pub mod error;
pub mod event;
pub mod keys;
pub mod logging;
pub mod relay;
pub mod session;
pub mod tunnel;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version stamped on every outgoing rumor.
pub const PROTOCOL_VERSION: &str = "2.0.2";

/// Version family accepted on receive: any version containing this.
pub const PROTOCOL_VERSION_FAMILY: &str = "2.0.";

/// Event kind of the inner, unsigned rumor.
pub const RUMOR_KIND: u32 = 20547;

/// Event kind of the legacy seal layer.
pub const SEAL_KIND: u32 = 20013;

/// Event kind of the published gift wrap (ephemeral kind class).
pub const GIFT_WRAP_KIND: u32 = 21059;

/// Check whether a rumor's version tag is acceptable.
///
/// Missing versions are tolerated (legacy peers); mismatched ones are
/// not.
pub fn version_compatible(version: Option<&str>) -> bool {
    match version {
        Some(v) => v.contains(PROTOCOL_VERSION_FAMILY),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_family() {
        assert!(version_compatible(Some("2.0.2")));
        assert!(version_compatible(Some("v2.0.7")));
        assert!(version_compatible(None));
        assert!(!version_compatible(Some("1.9.0")));
        assert!(!version_compatible(Some("3.0.0")));
    }
}
