//! A single relay WebSocket connection.
//!
//! Each connection owns a writer task draining an outbound queue and a
//! reader task parsing relay messages. Publish acknowledgements are
//! correlated back to callers through a pending map keyed by event id,
//! so many publishes can be in flight on one socket.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::logging::AbbrevHex;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

/// Outbound queue depth per connection.
const WRITE_QUEUE_DEPTH: usize = 64;

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

/// One logical connection to a relay URL.
#[derive(Clone)]
pub(crate) struct RelayConnection {
    url: String,
    out_tx: mpsc::Sender<Message>,
    pending_acks: Arc<Mutex<HashMap<String, AckSender>>>,
}

impl RelayConnection {
    /// Dial `url` and start the reader/writer tasks.
    ///
    /// Incoming events are forwarded to `incoming`; both tasks exit
    /// when `shutdown` flips or the socket closes.
    pub(crate) async fn connect(
        url: &str,
        incoming: mpsc::Sender<Event>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Relay(format!("{url}: {e}")))?;
        let (mut ws_write, mut ws_read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(WRITE_QUEUE_DEPTH);
        let pending_acks: Arc<Mutex<HashMap<String, AckSender>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Writer: drain the outbound queue onto the socket.
        let writer_url = url.to_string();
        let mut writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = out_rx.recv() => match maybe {
                        Some(message) => {
                            if let Err(e) = ws_write.send(message).await {
                                warn!(relay = %writer_url, "write failed: {e}");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.changed() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader: parse relay messages, resolve acks, forward events.
        let reader_url = url.to_string();
        let reader_acks = Arc::clone(&pending_acks);
        let reader_out = out_tx.clone();
        let mut reader_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = ws_read.next() => match maybe {
                        Some(Ok(Message::Text(text))) => {
                            handle_text(&reader_url, &text, &reader_acks, &incoming).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = reader_out.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(relay = %reader_url, "connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %reader_url, "read failed: {e}");
                            break;
                        }
                    },
                    _ = reader_shutdown.changed() => break,
                }
            }
            // Fail any publishes still waiting on this socket.
            let mut acks = reader_acks.lock().await;
            for (_, tx) in acks.drain() {
                let _ = tx.send(Err("connection closed".into()));
            }
        });

        Ok(Self {
            url: url.to_string(),
            out_tx,
            pending_acks,
        })
    }

    /// This connection's relay URL.
    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Publish an event and wait for the relay's acknowledgement.
    pub(crate) async fn publish(&self, event: &Event, timeout: Duration) -> Result<()> {
        let frame = serde_json::json!(["EVENT", event]).to_string();

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .await
            .insert(event.id.clone(), ack_tx);

        if self.out_tx.send(Message::Text(frame)).await.is_err() {
            self.pending_acks.lock().await.remove(&event.id);
            return Err(Error::Relay("connection closed".into()));
        }

        let outcome = tokio::time::timeout(timeout, ack_rx).await;
        // Whatever happened, the entry must not leak.
        self.pending_acks.lock().await.remove(&event.id);

        match outcome {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(Error::Relay(reason)),
            Ok(Err(_)) => Err(Error::Relay("connection closed".into())),
            Err(_) => Err(Error::Relay("ack timeout".into())),
        }
    }

    /// Install a subscription filter under `sub_id`.
    pub(crate) async fn subscribe(&self, sub_id: &str, filter: &serde_json::Value) -> Result<()> {
        let frame = serde_json::json!(["REQ", sub_id, filter]).to_string();
        self.out_tx
            .send(Message::Text(frame))
            .await
            .map_err(|_| Error::Relay("connection closed".into()))
    }
}

/// Dispatch one text frame from the relay.
async fn handle_text(
    url: &str,
    text: &str,
    pending_acks: &Mutex<HashMap<String, AckSender>>,
    incoming: &mpsc::Sender<Event>,
) {
    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            trace!(relay = %url, "unparseable frame");
            return;
        }
    };
    let items = match frame.as_array() {
        Some(items) if !items.is_empty() => items,
        _ => return,
    };

    match items[0].as_str() {
        Some("EVENT") if items.len() >= 3 => {
            match serde_json::from_value::<Event>(items[2].clone()) {
                Ok(event) => {
                    trace!(relay = %url, id = %AbbrevHex(&event.id), "event received");
                    // Blocking send: per-connection fan-in backpressure.
                    // The pool applies the drop-newest policy downstream.
                    let _ = incoming.send(event).await;
                }
                Err(_) => debug!(relay = %url, "malformed event in frame"),
            }
        }
        Some("OK") if items.len() >= 3 => {
            let id = items[1].as_str().unwrap_or_default();
            let accepted = items[2].as_bool().unwrap_or(false);
            let reason = items
                .get(3)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if let Some(tx) = pending_acks.lock().await.remove(id) {
                let _ = tx.send(if accepted {
                    Ok(())
                } else {
                    Err(if reason.is_empty() {
                        "rejected".into()
                    } else {
                        reason
                    })
                });
            }
        }
        Some("EOSE") => trace!(relay = %url, "end of stored events"),
        Some("NOTICE") => {
            debug!(relay = %url, notice = %items.get(1).and_then(|v| v.as_str()).unwrap_or(""), "relay notice");
        }
        _ => trace!(relay = %url, "unhandled frame"),
    }
}
