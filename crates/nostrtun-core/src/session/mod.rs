//! Per-connection session state and ordered delivery.
//!
//! A session maps one TCP connection onto a sequence of events. Each
//! endpoint tracks the send-side sequence allocator and a receive-side
//! reorder buffer; a dispatcher routes decrypted envelopes to the
//! owning session's queue by id. Sessions never touch the relay pool
//! directly; they publish through a capability handle owned by the
//! tunnel loops.

use crate::event::envelope::{PacketType, ParsedEnvelope};
use crate::keys::PublicKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Queue depth of a single session's inbound envelope channel.
pub const SESSION_QUEUE_DEPTH: usize = 128;

/// Envelopes buffered for a session whose `open` has not arrived yet.
/// Kept below the queue depth so a flush always fits.
const UNOPENED_BUFFER_LIMIT: usize = 64;

/// Build a fresh session id from the originating peer address.
///
/// Ids are opaque to receivers; the shape exists only for log
/// greppability. Characters that confuse log tooling are replaced.
pub fn new_session_id(client_addr: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let sanitized: String = client_addr
        .chars()
        .map(|c| match c {
            ':' | '.' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    format!("session_{nanos}_{sanitized}")
}

/// Which of a session's two directions is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Half {
    /// The direction this endpoint emits.
    Outbound,
    /// The direction this endpoint receives.
    Inbound,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; the `open` packet is not out yet.
    Opening,
    /// Both directions flowing.
    Established,
    /// One direction has seen its `close`.
    HalfClosed(Half),
    /// Both directions terminated.
    Closed,
}

/// One endpoint's view of a session.
#[derive(Debug)]
pub struct Session {
    id: String,
    peer: PublicKey,
    next_send: u64,
    state: SessionState,
}

impl Session {
    /// Create a session in `Opening` state.
    pub fn new(id: impl Into<String>, peer: PublicKey) -> Self {
        Self {
            id: id.into(),
            peer,
            next_send: 0,
            state: SessionState::Opening,
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The counterpart's public key.
    pub fn peer(&self) -> PublicKey {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session established.
    ///
    /// There is no handshake ACK; the opener transitions as soon as
    /// its `open` is published.
    pub fn establish(&mut self) {
        if self.state == SessionState::Opening {
            self.state = SessionState::Established;
        }
    }

    /// Allocate the next send sequence. Dense and monotone from 0.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_send;
        self.next_send += 1;
        seq
    }

    /// Record that one direction terminated; returns the new state.
    pub fn close_half(&mut self, half: Half) -> SessionState {
        self.state = match self.state {
            SessionState::Opening | SessionState::Established => SessionState::HalfClosed(half),
            SessionState::HalfClosed(existing) if existing != half => SessionState::Closed,
            current => current,
        };
        self.state
    }

    /// Force the terminal state, e.g. after a failed egress dial.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Whether both directions have terminated.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// Receive-side reordering for one session direction.
///
/// Sequences are dense and start at 0. The expected packet is
/// delivered immediately, later ones are buffered, earlier or
/// duplicate ones are dropped. Once a `close` is delivered the
/// direction is dead and everything after it is ignored.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, ParsedEnvelope>,
    closed: bool,
}

impl ReorderBuffer {
    /// A buffer expecting sequence 0 first.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sequence that will be delivered.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Whether this direction has delivered its `close`.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Offer one envelope; returns everything now deliverable, in
    /// sequence order.
    ///
    /// Heartbeats pass straight through without consuming a sequence
    /// number.
    pub fn push(&mut self, envelope: ParsedEnvelope) -> Vec<ParsedEnvelope> {
        if envelope.meta.packet_type == PacketType::Heartbeat {
            return if self.closed { Vec::new() } else { vec![envelope] };
        }
        if self.closed {
            return Vec::new();
        }

        let seq = envelope.meta.sequence;
        if seq < self.next_expected {
            debug!(session = %envelope.meta.session, seq, "dropping stale duplicate");
            return Vec::new();
        }
        if seq > self.next_expected {
            // First arrival wins; a replay of a buffered sequence is dropped.
            self.pending.entry(seq).or_insert(envelope);
            return Vec::new();
        }

        let mut ready = vec![envelope];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }

        if let Some(position) = ready
            .iter()
            .position(|e| e.meta.packet_type == PacketType::Close)
        {
            // Close terminates the direction; drop the overshoot.
            ready.truncate(position + 1);
            self.pending.clear();
            self.closed = true;
        }

        ready
    }
}

/// Routes decrypted envelopes to per-session queues.
///
/// Envelopes for sessions that have not been opened yet are buffered
/// and flushed when the session registers, so a `data` racing its
/// `open` across relays is not lost.
pub struct SessionDispatcher {
    inner: Mutex<DispatcherInner>,
}

struct DispatcherInner {
    queues: HashMap<String, mpsc::Sender<ParsedEnvelope>>,
    unopened: HashMap<String, Vec<ParsedEnvelope>>,
    seen: HashSet<String>,
}

impl SessionDispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DispatcherInner {
                queues: HashMap::new(),
                unopened: HashMap::new(),
                seen: HashSet::new(),
            }),
        }
    }

    /// Register a session and get its inbound queue.
    ///
    /// Any envelopes that arrived before registration are flushed into
    /// the queue first, in arrival order; the session's reorder buffer
    /// sorts them out.
    pub fn register(&self, session_id: &str) -> mpsc::Receiver<ParsedEnvelope> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seen.insert(session_id.to_string());
        if let Some(buffered) = inner.unopened.remove(session_id) {
            for envelope in buffered {
                if tx.try_send(envelope).is_err() {
                    warn!(session = %session_id, "session queue full during flush");
                    break;
                }
            }
        }
        inner.queues.insert(session_id.to_string(), tx);
        rx
    }

    /// Whether this id was ever registered; duplicate `open`s check
    /// here and are ignored.
    pub fn has_seen(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .contains(session_id)
    }

    /// Whether the session currently has a live queue.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .contains_key(session_id)
    }

    /// Route one envelope to its session.
    ///
    /// Unknown sessions get a bounded holding buffer; a full session
    /// queue drops the envelope (the relay fabric gives no delivery
    /// guarantee anyway, and stalling the dispatcher would starve
    /// every other session).
    pub fn route(&self, envelope: ParsedEnvelope) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let session_id = envelope.meta.session.clone();

        if let Some(queue) = inner.queues.get(&session_id) {
            if queue.try_send(envelope).is_err() {
                warn!(session = %session_id, "session queue full, dropping envelope");
            }
            return;
        }

        if inner.seen.contains(&session_id) {
            // Session already tore down; late stragglers are expected.
            debug!(session = %session_id, "envelope for finished session");
            return;
        }

        let buffered = inner.unopened.entry(session_id.clone()).or_default();
        if buffered.len() >= UNOPENED_BUFFER_LIMIT {
            warn!(session = %session_id, "unopened session buffer full, dropping envelope");
            return;
        }
        buffered.push(envelope);
    }

    /// Drop a finished session's queue.
    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queues.remove(session_id);
        inner.unopened.remove(session_id);
    }

    /// Number of sessions with live queues.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .len()
    }
}

impl Default for SessionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::envelope::{Direction, EnvelopeMeta};
    use crate::keys::Keypair;

    fn envelope(session: &str, seq: u64, packet_type: PacketType, payload: &[u8]) -> ParsedEnvelope {
        ParsedEnvelope {
            payload: payload.to_vec(),
            meta: EnvelopeMeta::new(packet_type, session, seq, Direction::ClientToServer),
            sender: Keypair::generate().public(),
        }
    }

    #[test]
    fn test_session_id_is_sanitized_and_unique() {
        let a = new_session_id("127.0.0.1:4000");
        let b = new_session_id("127.0.0.1:4000");
        assert_ne!(a, b);
        assert!(!a.contains(':'));
        assert!(!a.contains('.'));
    }

    #[test]
    fn test_session_sequences_are_dense() {
        let mut session = Session::new("s", Keypair::generate().public());
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
    }

    #[test]
    fn test_session_state_transitions() {
        let mut session = Session::new("s", Keypair::generate().public());
        assert_eq!(session.state(), SessionState::Opening);

        session.establish();
        assert_eq!(session.state(), SessionState::Established);

        assert_eq!(
            session.close_half(Half::Outbound),
            SessionState::HalfClosed(Half::Outbound)
        );
        // Closing the same half again changes nothing.
        assert_eq!(
            session.close_half(Half::Outbound),
            SessionState::HalfClosed(Half::Outbound)
        );
        assert_eq!(session.close_half(Half::Inbound), SessionState::Closed);
        assert!(session.is_closed());
    }

    #[test]
    fn test_reorder_in_order_delivery() {
        let mut buffer = ReorderBuffer::new();
        for seq in 0..4 {
            let ready = buffer.push(envelope("s", seq, PacketType::Data, &[seq as u8]));
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].meta.sequence, seq);
        }
    }

    #[test]
    fn test_reorder_buffers_gap() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(envelope("s", 2, PacketType::Data, b"c")).is_empty());
        assert!(buffer.push(envelope("s", 1, PacketType::Data, b"b")).is_empty());

        let ready = buffer.push(envelope("s", 0, PacketType::Data, b"a"));
        let payloads: Vec<_> = ready.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_reorder_drops_duplicates() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(envelope("s", 0, PacketType::Data, b"x")).len(), 1);
        assert!(buffer.push(envelope("s", 0, PacketType::Data, b"x")).is_empty());

        // Duplicate of a buffered future packet keeps the first copy.
        assert!(buffer.push(envelope("s", 2, PacketType::Data, b"first")).is_empty());
        assert!(buffer.push(envelope("s", 2, PacketType::Data, b"second")).is_empty());
        let ready = buffer.push(envelope("s", 1, PacketType::Data, b"y"));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[1].payload, b"first");
    }

    #[test]
    fn test_reorder_close_is_terminal() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(envelope("s", 0, PacketType::Data, b"a")).len(), 1);

        let ready = buffer.push(envelope("s", 1, PacketType::Close, b""));
        assert_eq!(ready.len(), 1);
        assert!(buffer.is_closed());

        assert!(buffer.push(envelope("s", 2, PacketType::Data, b"late")).is_empty());
    }

    #[test]
    fn test_reorder_close_cuts_buffered_overshoot() {
        let mut buffer = ReorderBuffer::new();
        // Data beyond the close arrives first.
        assert!(buffer.push(envelope("s", 2, PacketType::Data, b"ghost")).is_empty());
        assert!(buffer.push(envelope("s", 1, PacketType::Close, b"")).is_empty());

        let ready = buffer.push(envelope("s", 0, PacketType::Data, b"a"));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[1].meta.packet_type, PacketType::Close);
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_heartbeat_bypasses_sequencing() {
        let mut buffer = ReorderBuffer::new();
        let ready = buffer.push(envelope("s", 999, PacketType::Heartbeat, b""));
        assert_eq!(ready.len(), 1);
        // Sequence space untouched.
        assert_eq!(buffer.next_expected(), 0);
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_session() {
        let dispatcher = SessionDispatcher::new();
        let mut rx_a = dispatcher.register("a");
        let mut rx_b = dispatcher.register("b");

        dispatcher.route(envelope("a", 0, PacketType::Data, b"for a"));
        dispatcher.route(envelope("b", 0, PacketType::Data, b"for b"));

        assert_eq!(rx_a.recv().await.expect("a").payload, b"for a");
        assert_eq!(rx_b.recv().await.expect("b").payload, b"for b");
    }

    #[tokio::test]
    async fn test_dispatcher_buffers_before_open() {
        let dispatcher = SessionDispatcher::new();

        // Data outruns the open across relays.
        dispatcher.route(envelope("s", 1, PacketType::Data, b"early"));
        dispatcher.route(envelope("s", 0, PacketType::Open, b""));

        let mut rx = dispatcher.register("s");
        let first = rx.recv().await.expect("buffered");
        let second = rx.recv().await.expect("buffered");
        assert_eq!(first.meta.sequence, 1);
        assert_eq!(second.meta.sequence, 0);
    }

    #[test]
    fn test_dispatcher_seen_tracks_duplicate_opens() {
        let dispatcher = SessionDispatcher::new();
        assert!(!dispatcher.has_seen("s"));
        let _rx = dispatcher.register("s");
        assert!(dispatcher.has_seen("s"));

        dispatcher.remove("s");
        // Still seen: a late duplicate open must not resurrect it.
        assert!(dispatcher.has_seen("s"));
        assert!(!dispatcher.is_active("s"));
    }
}
