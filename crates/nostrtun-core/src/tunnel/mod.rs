//! Tunnel endpoints: the ingress (client) and egress (server) loops.
//!
//! Both ends share the same machinery: a subscription pump that
//! decrypts incoming gift wraps and routes them to sessions, a
//! socket-drain pump that batches stream bytes into `data` events, and
//! an ordered-delivery pump that writes decrypted payloads back into a
//! socket. Sessions talk to the relay pool only through the
//! [`PacketSender`] capability handle.

pub mod egress;
pub mod ingress;

pub use egress::{run_egress, EgressConfig};
pub use ingress::{run_ingress, IngressConfig};

use crate::crypto::EphemeralPool;
use crate::error::Result;
use crate::event::envelope::{self, Direction, EnvelopeMeta, PacketType, ParsedEnvelope};
use crate::keys::{Keypair, PublicKey};
use crate::relay::RelayPool;
use crate::session::{Half, ReorderBuffer, Session, SessionDispatcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Knobs shared by both tunnel roles.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Flush a data batch at this size.
    pub batch_bytes: usize,
    /// Flush a nonempty batch after this long.
    pub batch_timeout: Duration,
    /// Socket read deadline enforcing the batch-flush timer.
    pub read_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            batch_bytes: 16 * 1024,
            batch_timeout: Duration::from_millis(50),
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// The publish capability handed to sessions.
///
/// Wraps the identity, the ephemeral pool and the relay pool so a
/// session can emit packets without holding any of them directly.
#[derive(Clone)]
pub struct PacketSender {
    identity: Arc<Keypair>,
    ephemeral: Arc<EphemeralPool>,
    pool: Arc<RelayPool>,
}

impl PacketSender {
    /// Bundle the three resources into a handle.
    pub fn new(identity: Arc<Keypair>, ephemeral: Arc<EphemeralPool>, pool: Arc<RelayPool>) -> Self {
        Self {
            identity,
            ephemeral,
            pool,
        }
    }

    /// Our identity public key.
    pub fn identity_public(&self) -> PublicKey {
        self.identity.public()
    }

    /// Wrap and publish, waiting for at least one relay ACK.
    ///
    /// Used for `open` and `close`, whose ordering relative to data
    /// matters.
    pub async fn send_sync(
        &self,
        recipient: &PublicKey,
        payload: &[u8],
        meta: &EnvelopeMeta,
    ) -> Result<()> {
        let gift = envelope::wrap(&self.ephemeral, &self.identity, recipient, payload, meta)?;
        self.pool.publish(&gift).await
    }

    /// Wrap and publish fire-and-forget; the hot data path.
    pub fn send_async(&self, recipient: &PublicKey, payload: &[u8], meta: &EnvelopeMeta) -> Result<()> {
        let gift = envelope::wrap(&self.ephemeral, &self.identity, recipient, payload, meta)?;
        self.pool.publish_async(gift);
        Ok(())
    }

    /// Precompute the conversation-key cache for `recipient` off the
    /// packet path.
    ///
    /// For the default pool size this costs a few hundred
    /// milliseconds of scalar multiplications, so it runs on the
    /// blocking thread pool.
    pub async fn warm(&self, recipient: PublicKey) -> Result<()> {
        let ephemeral = Arc::clone(&self.ephemeral);
        tokio::task::spawn_blocking(move || ephemeral.ensure_precomputed(&recipient))
            .await
            .map_err(|_| crate::Error::Session("precompute task failed".into()))?
    }
}

/// Decrypt gift wraps off the subscription stream and route them.
///
/// Envelopes flowing the wrong direction and events that fail any
/// validation are dropped here; codec errors are logged and never
/// fatal.
pub(crate) async fn pump_subscription(
    mut events: mpsc::Receiver<crate::event::Event>,
    identity: Arc<Keypair>,
    dispatcher: Arc<SessionDispatcher>,
    expect_direction: Direction,
    mut on_open: Option<mpsc::Sender<ParsedEnvelope>>,
) {
    while let Some(event) = events.recv().await {
        let parsed = match envelope::unwrap(&identity, &event) {
            Ok(parsed) => parsed,
            Err(e) if e.is_droppable() => {
                debug!("dropping event: {e}");
                continue;
            }
            Err(e) => {
                warn!("dropping event: {e}");
                continue;
            }
        };

        if parsed.meta.direction != expect_direction {
            continue;
        }

        if parsed.meta.packet_type == PacketType::Open {
            if let Some(open_tx) = &mut on_open {
                if dispatcher.has_seen(&parsed.meta.session) {
                    debug!(session = %parsed.meta.session, "duplicate open ignored");
                } else if open_tx.send(parsed).await.is_err() {
                    break;
                }
                continue;
            }
        }

        dispatcher.route(parsed);
    }
}

/// Drain a TCP read half into `data` events, batching bytes.
///
/// Emits one `data` event per batch at the next sequence, then a
/// synchronous `close` (carrying `close_error` if set) when the socket
/// ends. `close_sent` lets the surrounding scope know whether it still
/// owes the peer a close.
pub(crate) async fn pump_socket(
    mut read_half: OwnedReadHalf,
    session: Arc<Mutex<Session>>,
    sender: PacketSender,
    recipient: PublicKey,
    direction: Direction,
    config: TunnelConfig,
    close_error: Option<String>,
    close_sent: Arc<AtomicBool>,
) {
    let session_id = lock(&session).id().to_string();
    let mut chunk = vec![0u8; 4096];
    let mut batch: Vec<u8> = Vec::with_capacity(config.batch_bytes);
    let mut batch_started: Option<Instant> = None;

    loop {
        let due = batch_started
            .map(|t| t.elapsed() >= config.batch_timeout)
            .unwrap_or(false);
        if batch.len() >= config.batch_bytes || (due && !batch.is_empty()) {
            flush_batch(&session, &sender, &recipient, direction, &session_id, &mut batch);
            batch_started = None;
        }

        match tokio::time::timeout(config.read_timeout, read_half.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if batch.is_empty() {
                    batch_started = Some(Instant::now());
                }
                batch.extend_from_slice(&chunk[..n]);
            }
            Ok(Err(e)) => {
                debug!(session = %session_id, "socket read ended: {e}");
                break;
            }
            // Deadline lap; loop back to check the batch timer.
            Err(_) => continue,
        }
    }

    if !batch.is_empty() {
        flush_batch(&session, &sender, &recipient, direction, &session_id, &mut batch);
    }

    send_close(
        &session,
        &sender,
        &recipient,
        direction,
        close_error,
        &close_sent,
    )
    .await;
}

fn flush_batch(
    session: &Arc<Mutex<Session>>,
    sender: &PacketSender,
    recipient: &PublicKey,
    direction: Direction,
    session_id: &str,
    batch: &mut Vec<u8>,
) {
    let sequence = lock(session).next_sequence();
    let meta = EnvelopeMeta::new(PacketType::Data, session_id, sequence, direction);
    if let Err(e) = sender.send_async(recipient, batch, &meta) {
        warn!(session = %session_id, sequence, "failed to emit data event: {e}");
    }
    batch.clear();
}

/// Publish this session's final `close` exactly once.
pub(crate) async fn send_close(
    session: &Arc<Mutex<Session>>,
    sender: &PacketSender,
    recipient: &PublicKey,
    direction: Direction,
    error: Option<String>,
    close_sent: &AtomicBool,
) {
    if close_sent.swap(true, Ordering::SeqCst) {
        return;
    }

    let (session_id, sequence) = {
        let mut guard = lock(session);
        guard.close_half(Half::Outbound);
        (guard.id().to_string(), guard.next_sequence())
    };

    let mut meta = EnvelopeMeta::new(PacketType::Close, &session_id, sequence, direction);
    meta.error = error;
    if let Err(e) = sender.send_sync(recipient, b"", &meta).await {
        warn!(session = %session_id, "failed to publish close: {e}");
    } else {
        debug!(session = %session_id, sequence, "close published");
    }
}

/// Deliver ordered inbound payloads into a TCP write half.
///
/// Consumes the session's envelope queue through a reorder buffer,
/// answers heartbeats in kind, and returns when the peer's `close`
/// arrives, the queue ends, or the socket refuses a write. Envelopes
/// from anyone but the session peer are dropped.
pub(crate) async fn deliver_to_socket(
    mut inbound: mpsc::Receiver<ParsedEnvelope>,
    mut write_half: OwnedWriteHalf,
    session: Arc<Mutex<Session>>,
    sender: PacketSender,
    reply_direction: Direction,
) {
    let (session_id, expected_peer) = {
        let guard = lock(&session);
        (guard.id().to_string(), guard.peer())
    };
    let mut reorder = ReorderBuffer::new();

    while let Some(envelope) = inbound.recv().await {
        if envelope.sender != expected_peer {
            debug!(session = %session_id, "envelope from unexpected sender dropped");
            continue;
        }

        for ready in reorder.push(envelope) {
            match ready.meta.packet_type {
                PacketType::Data => {
                    if let Err(e) = write_half.write_all(&ready.payload).await {
                        debug!(session = %session_id, "socket write ended: {e}");
                        return;
                    }
                }
                PacketType::Close => {
                    if let Some(reason) = &ready.meta.error {
                        info!(session = %session_id, reason = %reason, "peer closed with error");
                    }
                    lock(&session).close_half(Half::Inbound);
                    let _ = write_half.shutdown().await;
                    return;
                }
                PacketType::Heartbeat => {
                    let meta = EnvelopeMeta::new(
                        PacketType::Heartbeat,
                        &session_id,
                        0,
                        reply_direction,
                    );
                    if let Err(e) = sender.send_async(&ready.sender, b"", &meta) {
                        debug!(session = %session_id, "heartbeat reply failed: {e}");
                    }
                }
                // The dispatcher handled session creation; a routed
                // open carries nothing to deliver.
                PacketType::Open => {}
            }
        }
    }
}

pub(crate) fn lock(session: &Arc<Mutex<Session>>) -> std::sync::MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}
