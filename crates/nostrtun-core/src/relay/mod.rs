//! The relay pool: publish fan-out and deduplicated subscribe.
//!
//! One logical connection per configured relay URL. Publishing fans
//! out to every live connection and succeeds when at least one relay
//! acknowledges. Subscribing installs the same filter everywhere and
//! merges the streams, dropping duplicate event ids so the session
//! layer sees each event once no matter how many relays replicate it.
//!
//! The pool makes no ordering promise across relays; reordering is the
//! session layer's job.

mod connection;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::keys::PublicKey;
use crate::logging::AbbrevHex;
use crate::GIFT_WRAP_KIND;
use connection::RelayConnection;
use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Buffered events on the merged subscribe stream.
pub const SUBSCRIBE_BUFFER: usize = 100;

/// Sliding window of event ids remembered for deduplication.
const DEDUP_WINDOW: usize = 4_096;

/// How long a synchronous publish waits for any relay acknowledgement.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// A subscription filter in the relay protocol's JSON shape.
#[derive(Debug, Clone, Serialize)]
pub struct Filter {
    /// Event kinds to match.
    pub kinds: Vec<u32>,
    /// Recipient `p` tags to match.
    #[serde(rename = "#p")]
    pub p_tags: Vec<String>,
}

impl Filter {
    /// The tunnel's standing filter: gift wraps addressed to us.
    pub fn gift_wraps_for(recipient: &PublicKey) -> Self {
        Self {
            kinds: vec![GIFT_WRAP_KIND],
            p_tags: vec![recipient.to_hex()],
        }
    }
}

/// A pool of relay connections with shared shutdown.
pub struct RelayPool {
    connections: Vec<RelayConnection>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    raw_tx: mpsc::Sender<Event>,
    raw_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Event>>>,
}

impl RelayPool {
    /// Connect to every URL, keeping the subset that succeeded.
    ///
    /// Per-URL failures are logged and tolerated; zero usable relays
    /// fails construction.
    pub async fn connect(urls: &[String]) -> Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Fan-in point for every connection's reader task.
        let (raw_tx, raw_rx) = mpsc::channel::<Event>(SUBSCRIBE_BUFFER);

        let mut connections = Vec::new();
        for url in urls {
            match RelayConnection::connect(url, raw_tx.clone(), shutdown_rx.clone()).await {
                Ok(conn) => {
                    info!(relay = %url, "connected");
                    connections.push(conn);
                }
                Err(e) => warn!(relay = %url, "connect failed: {e}"),
            }
        }

        if connections.is_empty() {
            return Err(Error::Config("no relay could be reached".into()));
        }

        Ok(Arc::new(Self {
            connections,
            shutdown_tx,
            shutdown_rx,
            raw_tx,
            raw_rx: tokio::sync::Mutex::new(Some(raw_rx)),
        }))
    }

    /// Number of live connections retained at construction.
    pub fn relay_count(&self) -> usize {
        self.connections.len()
    }

    /// Publish to all relays in parallel; ok when at least one ACKs.
    ///
    /// On total failure the error carries the per-relay reasons.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let attempts = self.connections.iter().map(|conn| async move {
            (
                conn.url().to_string(),
                conn.publish(event, PUBLISH_TIMEOUT)
                    .await
                    .map_err(|e| e.to_string()),
            )
        });
        let outcomes: Vec<_> = futures_util::future::join_all(attempts).await;

        let total = outcomes.len();
        let accepted = aggregate_publish_outcomes(outcomes)?;
        if accepted < total {
            debug!(
                id = %AbbrevHex(&event.id),
                accepted,
                failed = total - accepted,
                "partial publish"
            );
        }
        Ok(())
    }

    /// Fire-and-forget publish for the hot data path.
    ///
    /// Failures are logged, never propagated; a synchronous quorum per
    /// data packet would put relay latency on the TCP read path.
    pub fn publish_async(self: &Arc<Self>, event: Event) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.publish(&event).await {
                warn!(id = %AbbrevHex(&event.id), "async publish failed: {e}");
            }
        });
    }

    /// Install `filter` on every relay and return the merged,
    /// deduplicated event stream.
    ///
    /// The stream is bounded at [`SUBSCRIBE_BUFFER`]; under pressure
    /// newer events are dropped and logged. Can be consumed once per
    /// pool.
    pub async fn subscribe(&self, filter: &Filter) -> Result<mpsc::Receiver<Event>> {
        let filter_json = serde_json::to_value(filter)
            .map_err(|_| Error::Relay("filter serialization failed".into()))?;

        for conn in &self.connections {
            conn.subscribe("tunnel", &filter_json).await?;
        }

        let mut raw_rx = self
            .raw_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Relay("subscription stream already taken".into()))?;

        let (dedup_tx, dedup_rx) = mpsc::channel::<Event>(SUBSCRIBE_BUFFER);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut seen = LruCache::<String, ()>::new(
                NonZeroUsize::new(DEDUP_WINDOW).unwrap_or(NonZeroUsize::MIN),
            );
            loop {
                tokio::select! {
                    maybe = raw_rx.recv() => match maybe {
                        Some(event) => {
                            if seen.put(event.id.clone(), ()).is_some() {
                                continue;
                            }
                            if let Err(mpsc::error::TrySendError::Full(event)) =
                                dedup_tx.try_send(event)
                            {
                                warn!(id = %AbbrevHex(&event.id), "subscribe buffer full, dropping event");
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(dedup_rx)
    }

    /// Shut down every connection and terminate the pool's tasks.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A sender feeding the raw (pre-dedup) stream; test hook for
    /// injecting events without a socket.
    #[doc(hidden)]
    pub fn raw_injector(&self) -> mpsc::Sender<Event> {
        self.raw_tx.clone()
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Aggregate per-relay publish outcomes: ok iff at least one accepted.
///
/// Factored out of [`RelayPool::publish`]'s shape so the acceptance
/// rule is testable without sockets.
pub fn aggregate_publish_outcomes(
    outcomes: Vec<(String, std::result::Result<(), String>)>,
) -> Result<usize> {
    let mut errors = HashMap::new();
    let mut accepted = 0usize;
    for (url, outcome) in outcomes {
        match outcome {
            Ok(()) => accepted += 1,
            Err(reason) => {
                errors.insert(url, reason);
            }
        }
    }
    if accepted == 0 {
        Err(Error::NoRelayAccepted { errors })
    } else {
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_shape() {
        let kp = crate::keys::Keypair::generate();
        let filter = Filter::gift_wraps_for(&kp.public());
        let json = serde_json::to_value(&filter).expect("serialize");

        assert_eq!(json["kinds"][0], GIFT_WRAP_KIND);
        assert_eq!(json["#p"][0], kp.public().to_hex());
    }

    #[test]
    fn test_publish_aggregation_any_ack_wins() {
        let outcomes = vec![
            ("ws://a".to_string(), Err("refused".to_string())),
            ("ws://b".to_string(), Ok(())),
            ("ws://c".to_string(), Err("timeout".to_string())),
        ];
        assert_eq!(aggregate_publish_outcomes(outcomes).expect("accepted"), 1);
    }

    #[test]
    fn test_publish_aggregation_total_failure() {
        let outcomes = vec![
            ("ws://a".to_string(), Err("refused".to_string())),
            ("ws://b".to_string(), Err("timeout".to_string())),
        ];
        match aggregate_publish_outcomes(outcomes) {
            Err(Error::NoRelayAccepted { errors }) => {
                assert_eq!(errors.len(), 2);
                assert_eq!(errors["ws://a"], "refused");
            }
            other => panic!("expected NoRelayAccepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_requires_one_relay() {
        // Nothing listens on this port; construction must fail.
        let urls = vec!["ws://127.0.0.1:1/".to_string()];
        assert!(RelayPool::connect(&urls).await.is_err());
    }
}
