//! Error types for the tunnel engine.
//!
//! Cryptographic and protocol errors are recoverable: the offending
//! event is dropped and the process continues. Only configuration
//! errors are fatal, and only at startup.

use std::collections::HashMap;
use thiserror::Error;

/// Core error type for tunnel operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Key string had the wrong length, prefix, or checksum.
    #[error("bad key format: {0}")]
    BadKeyFormat(String),

    /// Gift wrap or seal failed authenticated decryption.
    #[error("decryption failed")]
    DecryptError,

    /// Event or seal signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// Event kind was not the expected rumor/seal kind.
    #[error("bad event kind: {0}")]
    BadKind(u32),

    /// Rumor was not marked as TCP proxy traffic.
    #[error("bad proxy tag")]
    BadProxy,

    /// Rumor carried a version outside the accepted family.
    #[error("incompatible version: {0}")]
    BadVersion(String),

    /// Rumor content was not valid base64.
    #[error("bad base64 content")]
    BadBase64,

    /// Sequence tag was missing or non-numeric.
    #[error("bad sequence tag: {0}")]
    BadSequence(String),

    /// Target port tag was non-numeric or out of range.
    #[error("bad port tag: {0}")]
    BadPort(String),

    /// Type or direction tag held an unknown value.
    #[error("bad tag value: {0}")]
    BadType(String),

    /// A required rumor tag was absent.
    #[error("missing tag: {0}")]
    MissingTag(&'static str),

    /// No relay acknowledged a synchronous publish.
    #[error("no relay accepted the event")]
    NoRelayAccepted {
        /// Failure reason per relay URL.
        errors: HashMap<String, String>,
    },

    /// Relay transport failure (connect, send, protocol).
    #[error("relay error: {0}")]
    Relay(String),

    /// Session-local failure (dial, socket, queue).
    #[error("session error: {0}")]
    Session(String),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying socket I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using the tunnel [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is recovered by dropping the event.
    ///
    /// Such errors never tear down a session or the process.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Error::DecryptError
                | Error::BadSignature
                | Error::BadKind(_)
                | Error::BadProxy
                | Error::BadVersion(_)
                | Error::BadBase64
                | Error::BadSequence(_)
                | Error::BadPort(_)
                | Error::BadType(_)
                | Error::MissingTag(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droppable_classification() {
        assert!(Error::DecryptError.is_droppable());
        assert!(Error::BadVersion("9.9".into()).is_droppable());
        assert!(!Error::Config("missing key".into()).is_droppable());
        assert!(!Error::NoRelayAccepted {
            errors: HashMap::new()
        }
        .is_droppable());
    }
}
