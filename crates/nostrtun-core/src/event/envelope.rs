//! The encryption envelope: rumor, optional seal, gift wrap.
//!
//! Sending turns a packet payload plus its session metadata into a
//! published event in three layers:
//!
//! 1. **Rumor**: an unsigned event (kind 20547) authored by the real
//!    sender, with base64 payload in the content and metadata in the
//!    tags.
//! 2. **Seal** (legacy, optional): the rumor encrypted under the
//!    identity-to-identity conversation key, signed by the real
//!    sender (kind 20013).
//! 3. **Gift wrap**: the published event (kind 21059), the rumor (or
//!    seal) JSON encrypted under a one-time conversation key, authored
//!    and signed by a one-time keypair, tagged with the recipient.
//!
//! This implementation sends the direct-to-rumor form and accepts
//! both forms on receive.

use crate::crypto::{self, aead, EphemeralPool};
use crate::error::{Error, Result};
use crate::event::{unix_now, Event};
use crate::keys::{Keypair, PublicKey};
use crate::{version_compatible, GIFT_WRAP_KIND, PROTOCOL_VERSION, RUMOR_KIND, SEAL_KIND};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::fmt;
use tracing::debug;

/// Role of a packet within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// First packet of a session; the egress dials on it.
    Open,
    /// A batch of stream bytes.
    Data,
    /// Terminates one direction of a session.
    Close,
    /// Liveness probe; outside the sequence space.
    Heartbeat,
}

impl PacketType {
    /// Wire form of the `type` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Open => "open",
            PacketType::Data => "data",
            PacketType::Close => "close",
            PacketType::Heartbeat => "heartbeat",
        }
    }

    /// Parse the `type` tag.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(PacketType::Open),
            "data" => Ok(PacketType::Data),
            "close" => Ok(PacketType::Close),
            "heartbeat" => Ok(PacketType::Heartbeat),
            other => Err(Error::BadType(other.to_string())),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a packet flows within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the ingress toward the egress target.
    ClientToServer,
    /// From the egress target back to the ingress.
    ServerToClient,
}

impl Direction {
    /// Wire form of the `direction` tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }

    /// Parse the `direction` tag.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "client_to_server" => Ok(Direction::ClientToServer),
            "server_to_client" => Ok(Direction::ServerToClient),
            other => Err(Error::BadType(other.to_string())),
        }
    }

    /// The opposite direction.
    pub fn reverse(&self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried as tags on the inner rumor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMeta {
    /// Packet role.
    pub packet_type: PacketType,
    /// Opaque session identifier.
    pub session: String,
    /// Per-direction monotonic counter.
    pub sequence: u64,
    /// Flow direction.
    pub direction: Direction,
    /// Target host, set on `open` packets when the ingress overrides it.
    pub target_host: Option<String>,
    /// Target port companion to `target_host`.
    pub target_port: Option<u16>,
    /// Originating TCP peer address, informational.
    pub client_addr: Option<String>,
    /// Failure description on error `close` packets.
    pub error: Option<String>,
}

impl EnvelopeMeta {
    /// Metadata for a packet with no optional tags.
    pub fn new(
        packet_type: PacketType,
        session: impl Into<String>,
        sequence: u64,
        direction: Direction,
    ) -> Self {
        Self {
            packet_type,
            session: session.into(),
            sequence,
            direction,
            target_host: None,
            target_port: None,
            client_addr: None,
            error: None,
        }
    }

    fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![
            vec!["proxy".into(), "tcp".into()],
            vec!["version".into(), PROTOCOL_VERSION.into()],
            vec!["type".into(), self.packet_type.as_str().into()],
            vec!["session".into(), self.session.clone()],
            vec!["sequence".into(), self.sequence.to_string()],
            vec!["direction".into(), self.direction.as_str().into()],
        ];
        if let Some(host) = &self.target_host {
            tags.push(vec!["target_host".into(), host.clone()]);
        }
        if let Some(port) = self.target_port {
            tags.push(vec!["target_port".into(), port.to_string()]);
        }
        if let Some(addr) = &self.client_addr {
            tags.push(vec!["client_addr".into(), addr.clone()]);
        }
        if let Some(error) = &self.error {
            tags.push(vec!["error".into(), error.clone()]);
        }
        tags
    }
}

/// A fully validated, decrypted envelope.
#[derive(Debug, Clone)]
pub struct ParsedEnvelope {
    /// The tunneled bytes, possibly empty.
    pub payload: Vec<u8>,
    /// Session metadata from the rumor tags.
    pub meta: EnvelopeMeta,
    /// The real sender: the rumor author, never the gift-wrap key.
    pub sender: PublicKey,
}

/// Build the unsigned inner rumor for a packet.
pub fn build_rumor(identity: &PublicKey, payload: &[u8], meta: &EnvelopeMeta) -> Result<Event> {
    let content = if payload.is_empty() {
        String::new()
    } else {
        BASE64.encode(payload)
    };
    Event::build(RUMOR_KIND, content, meta.to_tags(), identity, unix_now())
}

/// Wrap a packet for `recipient` in the direct-to-rumor form.
///
/// Draws the next one-time keypair from `pool`, encrypts the rumor
/// under the precomputed conversation key for that slot, and signs the
/// outer event with the one-time key. The real identity appears only
/// inside the ciphertext.
pub fn wrap(
    pool: &EphemeralPool,
    identity: &Keypair,
    recipient: &PublicKey,
    payload: &[u8],
    meta: &EnvelopeMeta,
) -> Result<Event> {
    let rumor = build_rumor(&identity.public(), payload, meta)?;
    wrap_plaintext(pool, recipient, &rumor)
}

/// Wrap a packet in the legacy sealed form.
///
/// The rumor is first encrypted under the identity-to-identity
/// conversation key and signed by the real sender; the gift wrap then
/// encrypts the seal. Receivers accept both forms, so this exists for
/// compatibility with sealing peers.
pub fn wrap_sealed(
    pool: &EphemeralPool,
    identity: &Keypair,
    recipient: &PublicKey,
    payload: &[u8],
    meta: &EnvelopeMeta,
) -> Result<Event> {
    let rumor = build_rumor(&identity.public(), payload, meta)?;
    let rumor_json = serde_json::to_string(&rumor)
        .map_err(|_| Error::Session("rumor serialization failed".into()))?;

    let seal_key = crypto::conversation_key(identity, recipient)?;
    let sealed = aead::encrypt(&seal_key, rumor_json.as_bytes())?;

    let mut seal = Event::build(
        SEAL_KIND,
        BASE64.encode(sealed),
        Vec::new(),
        &identity.public(),
        unix_now(),
    )?;
    seal.sign(identity)?;

    wrap_plaintext(pool, recipient, &seal)
}

/// Encrypt an inner event into a signed gift wrap for `recipient`.
fn wrap_plaintext(pool: &EphemeralPool, recipient: &PublicKey, inner: &Event) -> Result<Event> {
    let inner_json = serde_json::to_string(inner)
        .map_err(|_| Error::Session("inner event serialization failed".into()))?;

    let (index, ephemeral) = pool.next();
    let key = pool.conversation_key(recipient, index)?;
    let ciphertext = aead::encrypt(&key, inner_json.as_bytes())?;

    let mut gift = Event::build(
        GIFT_WRAP_KIND,
        BASE64.encode(ciphertext),
        vec![vec!["p".into(), recipient.to_hex()]],
        &ephemeral.public(),
        unix_now(),
    )?;
    gift.sign(ephemeral)?;
    Ok(gift)
}

/// Unwrap a received gift wrap with our identity secret.
///
/// Accepts both the direct-to-rumor and the legacy sealed form. The
/// returned envelope's sender is the rumor author.
pub fn unwrap(identity: &Keypair, gift: &Event) -> Result<ParsedEnvelope> {
    if gift.kind != GIFT_WRAP_KIND {
        return Err(Error::BadKind(gift.kind));
    }

    let ephemeral_pub = gift.author()?;
    let key = crypto::conversation_key(identity, &ephemeral_pub)?;
    let ciphertext = BASE64.decode(&gift.content).map_err(|_| Error::BadBase64)?;
    let plaintext = aead::decrypt(&key, &ciphertext)?;

    let inner: Event = serde_json::from_slice(&plaintext).map_err(|_| Error::DecryptError)?;

    let rumor = if inner.kind == SEAL_KIND {
        inner.verify()?;
        let sender = inner.author()?;
        let seal_key = crypto::conversation_key(identity, &sender)?;
        let sealed = BASE64.decode(&inner.content).map_err(|_| Error::BadBase64)?;
        let rumor_plain = aead::decrypt(&seal_key, &sealed)?;
        serde_json::from_slice(&rumor_plain).map_err(|_| Error::DecryptError)?
    } else {
        inner
    };

    parse_rumor(&rumor)
}

/// Validate a decrypted rumor and extract payload plus metadata.
pub fn parse_rumor(rumor: &Event) -> Result<ParsedEnvelope> {
    if rumor.kind != RUMOR_KIND {
        return Err(Error::BadKind(rumor.kind));
    }
    if rumor.tag("proxy") != Some("tcp") {
        return Err(Error::BadProxy);
    }

    match rumor.tag("version") {
        Some(v) if !version_compatible(Some(v)) => {
            return Err(Error::BadVersion(v.to_string()));
        }
        None => debug!("rumor without version tag, treating as legacy peer"),
        _ => {}
    }

    let packet_type = PacketType::parse(rumor.tag("type").ok_or(Error::MissingTag("type"))?)?;
    let session = rumor
        .tag("session")
        .ok_or(Error::MissingTag("session"))?
        .to_string();
    let direction = Direction::parse(
        rumor
            .tag("direction")
            .ok_or(Error::MissingTag("direction"))?,
    )?;

    let sequence_text = rumor.tag("sequence").ok_or(Error::MissingTag("sequence"))?;
    let sequence: u64 = sequence_text
        .parse()
        .map_err(|_| Error::BadSequence(sequence_text.to_string()))?;

    let target_port = match rumor.tag("target_port") {
        Some(text) => Some(
            text.parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| Error::BadPort(text.to_string()))?,
        ),
        None => None,
    };

    let payload = if rumor.content.is_empty() {
        Vec::new()
    } else {
        BASE64.decode(&rumor.content).map_err(|_| Error::BadBase64)?
    };

    Ok(ParsedEnvelope {
        payload,
        meta: EnvelopeMeta {
            packet_type,
            session,
            sequence,
            direction,
            target_host: rumor.tag("target_host").map(str::to_string),
            target_port,
            client_addr: rumor.tag("client_addr").map(str::to_string),
            error: rumor.tag("error").map(str::to_string),
        },
        sender: rumor.author()?,
    })
}
