//! Ordering, duplicate-suppression and lifecycle properties of the
//! session layer, including envelope-level reordering as the relay
//! fabric would inflict it.

use nostrtun_core::crypto::EphemeralPool;
use nostrtun_core::event::envelope::{
    self, Direction, EnvelopeMeta, PacketType, ParsedEnvelope,
};
use nostrtun_core::keys::Keypair;
use nostrtun_core::session::{
    new_session_id, Half, ReorderBuffer, Session, SessionDispatcher, SessionState,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn data_envelope(session: &str, seq: u64, payload: &[u8], sender: &Keypair) -> ParsedEnvelope {
    ParsedEnvelope {
        payload: payload.to_vec(),
        meta: EnvelopeMeta::new(PacketType::Data, session, seq, Direction::ServerToClient),
        sender: sender.public(),
    }
}

fn close_envelope(session: &str, seq: u64, sender: &Keypair) -> ParsedEnvelope {
    ParsedEnvelope {
        payload: Vec::new(),
        meta: EnvelopeMeta::new(PacketType::Close, session, seq, Direction::ServerToClient),
        sender: sender.public(),
    }
}

/// Property: any permutation of consecutive data packets reassembles
/// into the payload concatenation in sequence order.
#[test]
fn any_permutation_reorders_to_original_bytes() {
    let sender = Keypair::generate();
    let count = 20u64;
    let expected: Vec<u8> = (0..count).map(|i| i as u8).collect();

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    for _ in 0..50 {
        let mut order: Vec<u64> = (0..count).collect();
        order.shuffle(&mut rng);

        let mut buffer = ReorderBuffer::new();
        let mut output = Vec::new();
        for seq in &order {
            for ready in buffer.push(data_envelope("s", *seq, &[*seq as u8], &sender)) {
                output.extend_from_slice(&ready.payload);
            }
        }
        assert_eq!(output, expected, "failed for order {order:?}");
    }
}

/// Scenario: a reorderer that swaps every adjacent pair of wrapped
/// events between wrap and unwrap must not change delivered bytes.
#[test]
fn adjacent_swap_between_wrap_and_unwrap_is_transparent() {
    let pool = EphemeralPool::new(8);
    let alice = Keypair::generate();
    let bob = Keypair::generate();

    let chunks: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 100]).collect();
    let mut wrapped = Vec::new();
    for (seq, chunk) in chunks.iter().enumerate() {
        let meta = EnvelopeMeta::new(
            PacketType::Data,
            "swap_session",
            seq as u64,
            Direction::ClientToServer,
        );
        wrapped.push(envelope::wrap(&pool, &alice, &bob.public(), chunk, &meta).expect("wrap"));
    }

    // The deterministic reorderer: swap each adjacent pair.
    for pair in wrapped.chunks_mut(2) {
        if pair.len() == 2 {
            pair.swap(0, 1);
        }
    }

    let mut buffer = ReorderBuffer::new();
    let mut output = Vec::new();
    for gift in &wrapped {
        let parsed = envelope::unwrap(&bob, gift).expect("unwrap");
        for ready in buffer.push(parsed) {
            output.extend_from_slice(&ready.payload);
        }
    }

    let expected: Vec<u8> = chunks.concat();
    assert_eq!(output, expected);
}

/// Property: delivering the same (session, sequence) twice emits bytes
/// exactly once.
#[test]
fn duplicate_sequences_emit_once() {
    let sender = Keypair::generate();
    let mut buffer = ReorderBuffer::new();
    let mut output = Vec::new();

    let deliveries = [0u64, 0, 1, 1, 1, 2, 0, 2];
    for seq in deliveries {
        for ready in buffer.push(data_envelope("s", seq, &[seq as u8], &sender)) {
            output.extend_from_slice(&ready.payload);
        }
    }
    assert_eq!(output, vec![0, 1, 2]);
}

/// Property: data buffered ahead of an unseen `open` is emitted only
/// after the open is processed.
#[tokio::test]
async fn open_before_data_even_when_data_arrives_first() {
    let sender = Keypair::generate();
    let dispatcher = SessionDispatcher::new();

    let data = data_envelope("late_open", 1, b"payload", &sender);
    let open = ParsedEnvelope {
        payload: Vec::new(),
        meta: EnvelopeMeta::new(
            PacketType::Open,
            "late_open",
            0,
            Direction::ServerToClient,
        ),
        sender: sender.public(),
    };

    // Data outruns the open.
    dispatcher.route(data);
    assert!(!dispatcher.has_seen("late_open"));

    // The open arrives; the session registers and both flush.
    let mut rx = dispatcher.register("late_open");
    dispatcher.route(open);

    let mut buffer = ReorderBuffer::new();
    let mut delivered = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        for ready in buffer.push(envelope) {
            delivered.push((ready.meta.packet_type, ready.meta.sequence));
        }
    }

    assert_eq!(
        delivered,
        vec![(PacketType::Open, 0), (PacketType::Data, 1)]
    );
}

/// Property: after a close at sequence k, later sequences in the same
/// direction are ignored.
#[test]
fn close_is_terminal_for_its_direction() {
    let sender = Keypair::generate();
    let mut buffer = ReorderBuffer::new();

    assert_eq!(buffer.push(data_envelope("s", 0, b"a", &sender)).len(), 1);
    let ready = buffer.push(close_envelope("s", 1, &sender));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].meta.packet_type, PacketType::Close);

    assert!(buffer.push(data_envelope("s", 2, b"late", &sender)).is_empty());
    assert!(buffer.push(data_envelope("s", 7, b"later", &sender)).is_empty());
    assert!(buffer.is_closed());
}

/// Property: between open and close a session hands out exactly the
/// dense sequence range with no gaps or repeats.
#[test]
fn send_side_sequences_are_dense() {
    let mut session = Session::new(new_session_id("10.1.1.1:9"), Keypair::generate().public());

    let open_seq = session.next_sequence();
    assert_eq!(open_seq, 0);
    session.establish();

    let data: Vec<u64> = (0..100).map(|_| session.next_sequence()).collect();
    let close_seq = session.next_sequence();

    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(data, expected);
    assert_eq!(close_seq, 101);
}

/// Lifecycle: both halves must close before the session is done, in
/// either order.
#[test]
fn session_closes_only_when_both_halves_do() {
    let peer = Keypair::generate().public();

    let mut session = Session::new("a", peer);
    session.establish();
    assert_eq!(
        session.close_half(Half::Inbound),
        SessionState::HalfClosed(Half::Inbound)
    );
    assert!(!session.is_closed());
    assert_eq!(session.close_half(Half::Outbound), SessionState::Closed);

    let mut session = Session::new("b", peer);
    session.establish();
    session.close_half(Half::Outbound);
    assert!(!session.is_closed());
    session.close_half(Half::Inbound);
    assert!(session.is_closed());
}

/// Scenario: ten interleaved sessions each receive exactly and only
/// their own bytes.
#[tokio::test]
async fn interleaved_sessions_demultiplex_cleanly() {
    let sender = Keypair::generate();
    let dispatcher = SessionDispatcher::new();

    let ids: Vec<String> = (0..10).map(|i| format!("session_{i}")).collect();
    let mut receivers = Vec::new();
    for id in &ids {
        receivers.push(dispatcher.register(id));
    }

    // Interleave: one packet per session per round, three rounds.
    for seq in 0..3u64 {
        for (i, id) in ids.iter().enumerate() {
            let tag = [i as u8; 8];
            dispatcher.route(data_envelope(id, seq, &tag, &sender));
        }
    }

    for (i, rx) in receivers.iter_mut().enumerate() {
        let mut buffer = ReorderBuffer::new();
        let mut bytes = Vec::new();
        for _ in 0..3 {
            let envelope = rx.try_recv().expect("own packet");
            for ready in buffer.push(envelope) {
                bytes.extend_from_slice(&ready.payload);
            }
        }
        assert_eq!(bytes, [i as u8; 24].to_vec());
        assert!(rx.try_recv().is_err(), "session got someone else's packet");
    }
}

/// A full duplex exchange at the envelope level: both directions run
/// their own sequence space and reorder independently.
#[test]
fn both_directions_have_independent_sequence_spaces() {
    let pool = EphemeralPool::new(8);
    let client = Keypair::generate();
    let server = Keypair::generate();
    let session = "duplex";

    // Client direction: open at 0, data at 1.
    let open_meta = EnvelopeMeta::new(PacketType::Open, session, 0, Direction::ClientToServer);
    let data_meta = EnvelopeMeta::new(PacketType::Data, session, 1, Direction::ClientToServer);
    let open = envelope::wrap(&pool, &client, &server.public(), b"", &open_meta).expect("wrap");
    let data =
        envelope::wrap(&pool, &client, &server.public(), b"request", &data_meta).expect("wrap");

    // Server direction: no open, first data at 0.
    let reply_meta = EnvelopeMeta::new(PacketType::Data, session, 0, Direction::ServerToClient);
    let reply =
        envelope::wrap(&pool, &server, &client.public(), b"response", &reply_meta).expect("wrap");

    let mut server_buffer = ReorderBuffer::new();
    let mut server_bytes = Vec::new();
    for gift in [&open, &data] {
        let parsed = envelope::unwrap(&server, gift).expect("unwrap");
        assert_eq!(parsed.meta.direction, Direction::ClientToServer);
        for ready in server_buffer.push(parsed) {
            server_bytes.extend_from_slice(&ready.payload);
        }
    }
    assert_eq!(server_bytes, b"request");

    let mut client_buffer = ReorderBuffer::new();
    let parsed = envelope::unwrap(&client, &reply).expect("unwrap");
    let ready = client_buffer.push(parsed);
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].payload, b"response");
}
