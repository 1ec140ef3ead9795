//! The egress (server) loop.
//!
//! Watches the subscription stream for `open` packets. Each one dials
//! the configured target and becomes a session: ordered client bytes
//! flow into the target socket, target bytes flow back as `data`
//! events addressed to the opening client's identity. A dial failure
//! answers with an error `close` instead of a session.

use super::{
    deliver_to_socket, lock, pump_socket, pump_subscription, send_close, PacketSender, TunnelConfig,
};
use crate::crypto::{EphemeralPool, DEFAULT_POOL_SIZE};
use crate::error::Result;
use crate::event::envelope::{Direction, EnvelopeMeta, PacketType, ParsedEnvelope};
use crate::keys::Keypair;
use crate::relay::{Filter, RelayPool};
use crate::session::{Session, SessionDispatcher};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Egress endpoint configuration.
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Default target host to dial.
    pub target_host: String,
    /// Default target port to dial.
    pub target_port: u16,
    /// Shared tunnel knobs.
    pub tunnel: TunnelConfig,
}

impl EgressConfig {
    /// The dial address for a session, honoring the `open` packet's
    /// optional target override tags.
    fn target_for(&self, open: &ParsedEnvelope) -> String {
        let host = open
            .meta
            .target_host
            .clone()
            .unwrap_or_else(|| self.target_host.clone());
        let port = open.meta.target_port.unwrap_or(self.target_port);
        format!("{host}:{port}")
    }
}

/// Run the egress until `shutdown` flips.
pub async fn run_egress(
    config: EgressConfig,
    identity: Arc<Keypair>,
    pool: Arc<RelayPool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ephemeral = Arc::new(EphemeralPool::new(DEFAULT_POOL_SIZE));
    let sender = PacketSender::new(Arc::clone(&identity), ephemeral, Arc::clone(&pool));

    let dispatcher = Arc::new(SessionDispatcher::new());
    let (open_tx, mut open_rx) = mpsc::channel::<ParsedEnvelope>(16);

    let events = pool.subscribe(&Filter::gift_wraps_for(&identity.public())).await?;
    tokio::spawn(pump_subscription(
        events,
        Arc::clone(&identity),
        Arc::clone(&dispatcher),
        Direction::ClientToServer,
        Some(open_tx),
    ));

    info!(
        dial_target = %format!("{}:{}", config.target_host, config.target_port),
        "egress watching for sessions"
    );

    loop {
        tokio::select! {
            maybe_open = open_rx.recv() => match maybe_open {
                Some(open) => {
                    if dispatcher.has_seen(&open.meta.session) {
                        debug!(session = %open.meta.session, "duplicate open ignored");
                        continue;
                    }
                    // Claim the id here, serially: later duplicate
                    // opens and racing data events all resolve against
                    // this registration.
                    let inbound = dispatcher.register(&open.meta.session);
                    let config = config.clone();
                    let sender = sender.clone();
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        handle_session(open, inbound, config, sender, dispatcher).await;
                    });
                }
                None => return Ok(()),
            },
            _ = shutdown.changed() => {
                info!("egress shutting down");
                pool.close();
                return Ok(());
            }
        }
    }
}

/// Drive one session from its `open` packet to teardown.
async fn handle_session(
    open: ParsedEnvelope,
    inbound: mpsc::Receiver<ParsedEnvelope>,
    config: EgressConfig,
    sender: PacketSender,
    dispatcher: Arc<SessionDispatcher>,
) {
    let session_id = open.meta.session.clone();
    let client = open.sender;
    let target = config.target_for(&open);
    info!(session = %session_id, dial_target = %target, "session opened");

    // The first reply will need the full conversation-key array for
    // this client; compute it before any bytes flow.
    if let Err(e) = sender.warm(client).await {
        warn!(session = %session_id, "precompute failed: {e}");
        dispatcher.remove(&session_id);
        return;
    }

    let session = Arc::new(Mutex::new(Session::new(&session_id, client)));
    dispatcher.route(open);

    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(session = %session_id, dial_target = %target, "dial failed: {e}");
            let sequence = {
                let mut guard = lock(&session);
                let sequence = guard.next_sequence();
                guard.close();
                sequence
            };

            let mut meta = EnvelopeMeta::new(
                PacketType::Close,
                &session_id,
                sequence,
                Direction::ServerToClient,
            );
            meta.error = Some(format!("dial failed: {e}"));
            if let Err(e) = sender.send_sync(&client, b"", &meta).await {
                warn!(session = %session_id, "failed to publish dial-failure close: {e}");
            }
            dispatcher.remove(&session_id);
            return;
        }
    };
    lock(&session).establish();

    let (read_half, write_half) = stream.into_split();
    let close_sent = Arc::new(AtomicBool::new(false));

    // Target bytes back to the client; the reverse stream has no open,
    // so its first data event is sequence 0.
    let uplink = pump_socket(
        read_half,
        Arc::clone(&session),
        sender.clone(),
        client,
        Direction::ServerToClient,
        config.tunnel.clone(),
        Some("target disconnected".to_string()),
        Arc::clone(&close_sent),
    );
    // Ordered client bytes into the target.
    let downlink = deliver_to_socket(
        inbound,
        write_half,
        Arc::clone(&session),
        sender.clone(),
        Direction::ServerToClient,
    );

    tokio::select! {
        _ = uplink => {}
        _ = downlink => {}
    }

    send_close(
        &session,
        &sender,
        &client,
        Direction::ServerToClient,
        None,
        &close_sent,
    )
    .await;

    dispatcher.remove(&session_id);
    debug!(session = %session_id, "session finished");
}
