//! The ingress (client) loop.
//!
//! Listens on a local TCP port. Each accepted connection becomes a
//! session: an `open` is published synchronously so the egress creates
//! its dispatch entry before any data arrives, then two pumps run
//! until either side ends: one batching socket bytes into `data`
//! events, one delivering ordered server payloads back into the
//! socket.

use super::{
    deliver_to_socket, lock, pump_socket, pump_subscription, send_close, PacketSender, TunnelConfig,
};
use crate::crypto::{EphemeralPool, DEFAULT_POOL_SIZE};
use crate::error::Result;
use crate::event::envelope::{Direction, EnvelopeMeta, PacketType};
use crate::keys::{Keypair, PublicKey};
use crate::relay::{Filter, RelayPool};
use crate::session::{new_session_id, Session, SessionDispatcher};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Ingress endpoint configuration.
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Local port to listen on.
    pub listen_port: u16,
    /// The egress endpoint's public key.
    pub server_key: PublicKey,
    /// Shared tunnel knobs.
    pub tunnel: TunnelConfig,
}

/// Run the ingress until `shutdown` flips.
///
/// Fails only on startup problems (bind, subscribe); per-connection
/// errors end their session and are logged.
pub async fn run_ingress(
    config: IngressConfig,
    identity: Arc<Keypair>,
    pool: Arc<RelayPool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ephemeral = Arc::new(EphemeralPool::new(DEFAULT_POOL_SIZE));
    let sender = PacketSender::new(Arc::clone(&identity), ephemeral, Arc::clone(&pool));

    // The server key is known now; take the precompute hit at startup
    // instead of on the first connection.
    sender.warm(config.server_key).await?;

    let dispatcher = Arc::new(SessionDispatcher::new());
    let events = pool.subscribe(&Filter::gift_wraps_for(&identity.public())).await?;
    tokio::spawn(pump_subscription(
        events,
        Arc::clone(&identity),
        Arc::clone(&dispatcher),
        Direction::ServerToClient,
        None,
    ));

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    info!(port = config.listen_port, "ingress listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(%peer_addr, "connection accepted");
                    let config = config.clone();
                    let sender = sender.clone();
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr.to_string(), config, sender, dispatcher)
                            .await;
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            _ = shutdown.changed() => {
                info!("ingress shutting down");
                pool.close();
                return Ok(());
            }
        }
    }
}

/// Drive one accepted connection through its session lifecycle.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: String,
    config: IngressConfig,
    sender: PacketSender,
    dispatcher: Arc<SessionDispatcher>,
) {
    let session_id = new_session_id(&peer_addr);
    let session = Arc::new(Mutex::new(Session::new(&session_id, config.server_key)));

    // Register before the open goes out so the reply direction has a
    // queue from the first event.
    let inbound = dispatcher.register(&session_id);

    let open_sequence = lock(&session).next_sequence();
    let mut open_meta = EnvelopeMeta::new(
        PacketType::Open,
        &session_id,
        open_sequence,
        Direction::ClientToServer,
    );
    open_meta.client_addr = Some(peer_addr.clone());

    // Open is synchronous: data must never outrun session creation on
    // the egress.
    if let Err(e) = sender.send_sync(&config.server_key, b"", &open_meta).await {
        warn!(session = %session_id, "failed to open session: {e}");
        dispatcher.remove(&session_id);
        return;
    }
    lock(&session).establish();
    info!(session = %session_id, %peer_addr, "session established");

    let (read_half, write_half) = stream.into_split();
    let close_sent = Arc::new(AtomicBool::new(false));

    let uplink = pump_socket(
        read_half,
        Arc::clone(&session),
        sender.clone(),
        config.server_key,
        Direction::ClientToServer,
        config.tunnel.clone(),
        None,
        Arc::clone(&close_sent),
    );
    let downlink = deliver_to_socket(
        inbound,
        write_half,
        Arc::clone(&session),
        sender.clone(),
        Direction::ClientToServer,
    );

    // The session ends when either pump exits; the other is cancelled
    // by the scope.
    tokio::select! {
        _ = uplink => {}
        _ = downlink => {}
    }

    send_close(
        &session,
        &sender,
        &config.server_key,
        Direction::ClientToServer,
        None,
        &close_sent,
    )
    .await;

    dispatcher.remove(&session_id);
    info!(session = %session_id, "session finished");
}
