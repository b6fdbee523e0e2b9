//! Cross-instance relay over a pub/sub bus.
//!
//! Every instance publishes locally originated envelopes to one shared
//! channel and subscribes to the same channel. Frames are tagged with the
//! publishing instance so a subscriber can skip its own; relayed envelopes are
//! only fanned out locally and never published again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;

use super::envelope::Envelope;
use super::error::GatewayError;
use super::hub::HubHandle;

/// Frames waiting for the publisher task. A full queue drops the relay copy.
pub const PUBLISH_QUEUE_CAPACITY: usize = 1024;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Transport used by the relay. Payloads are opaque strings.
#[async_trait]
pub trait RelayBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), GatewayError>;

    /// Open a subscription. The stream ends when the connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, GatewayError>;
}

/// Envelope as it travels on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayFrame {
    pub origin: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    publisher: OnceCell<redis::aio::ConnectionManager>,
}

impl RedisBus {
    pub fn open(url: &str) -> Result<Self, GatewayError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            publisher: OnceCell::new(),
        })
    }

    /// Shared auto-reconnecting connection for PUBLISH, created on first use.
    async fn publisher(&self) -> Result<redis::aio::ConnectionManager, GatewayError> {
        let conn = self
            .publisher
            .get_or_try_init(|| async {
                redis::aio::ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), GatewayError> {
        let mut conn = self.publisher().await?;
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, GatewayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(err) => {
                    tracing::warn!(%err, "non-text payload on relay channel");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// In-memory (single process, tests)
// ---------------------------------------------------------------------------

/// Process-local bus. Several hubs sharing one `MemoryBus` behave like
/// instances sharing a Redis server.
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    published: Mutex<Vec<(String, String)>>,
    buffer_size: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            buffer_size: 1024,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }

    /// Open subscriptions on a channel.
    pub fn subscribers(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |tx| tx.receiver_count())
    }

    /// Every `(channel, payload)` published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Envelopes published by a given instance, in order.
    pub fn published_by(&self, origin: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .filter_map(|(_, payload)| serde_json::from_str::<RelayFrame>(payload).ok())
            .filter(|frame| frame.origin == origin)
            .map(|frame| frame.envelope)
            .collect()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), GatewayError> {
        self.published
            .lock()
            .push((channel.to_string(), payload.clone()));
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, GatewayError> {
        let rx = self.sender(channel).subscribe();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Publishing side handed to the router. Never awaits the bus.
#[derive(Clone)]
pub struct RelayPublisher {
    origin: Arc<str>,
    queue: mpsc::Sender<String>,
}

impl RelayPublisher {
    pub(crate) fn new(origin: &str, queue: mpsc::Sender<String>) -> Self {
        Self {
            origin: Arc::from(origin),
            queue,
        }
    }

    pub fn publish(&self, envelope: &Envelope) {
        let frame = RelayFrame {
            origin: self.origin.to_string(),
            envelope: envelope.clone(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "failed to encode relay frame");
                return;
            }
        };

        match self.queue.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    room_id = %envelope.room_id,
                    kind = envelope.kind.as_str(),
                    "relay queue full, dropping relay copy"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("relay publisher stopped, dropping relay copy");
            }
        }
    }
}

/// Background tasks that move frames between the hub and the bus.
pub struct RelayBridge {
    cancel: CancellationToken,
    publisher: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

impl RelayBridge {
    /// Spawn the publisher and subscriber tasks. Relayed envelopes are handed
    /// to `hub`; the returned publisher feeds the bus.
    pub fn start(bus: Arc<dyn RelayBus>, config: &HubConfig, hub: HubHandle) -> (Self, RelayPublisher) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
        let publish = RelayPublisher::new(&config.instance_id, tx);
        let origin = publish.origin.clone();
        let channel: Arc<str> = Arc::from(config.relay_channel.as_str());

        let publisher = tokio::spawn(run_publisher(
            bus.clone(),
            channel.clone(),
            rx,
            cancel.clone(),
        ));
        let subscriber = tokio::spawn(run_subscriber(
            bus,
            channel,
            origin,
            hub,
            cancel.clone(),
        ));

        let bridge = Self {
            cancel,
            publisher,
            subscriber,
        };
        (bridge, publish)
    }

    /// Stop both tasks. Frames already queued are still published.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.publisher.await {
            tracing::warn!(%err, "relay publisher task failed");
        }
        if let Err(err) = self.subscriber.await {
            tracing::warn!(%err, "relay subscriber task failed");
        }
    }
}

async fn run_publisher(
    bus: Arc<dyn RelayBus>,
    channel: Arc<str>,
    mut queue: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            payload = queue.recv() => match payload {
                Some(payload) => publish_one(bus.as_ref(), &channel, payload).await,
                None => return,
            },
        }
    }

    while let Ok(payload) = queue.try_recv() {
        publish_one(bus.as_ref(), &channel, payload).await;
    }
    tracing::debug!("relay publisher stopped");
}

async fn publish_one(bus: &dyn RelayBus, channel: &str, payload: String) {
    if let Err(err) = bus.publish(channel, payload).await {
        tracing::warn!(%err, channel, "relay publish failed");
    }
}

async fn run_subscriber(
    bus: Arc<dyn RelayBus>,
    channel: Arc<str>,
    origin: Arc<str>,
    hub: HubHandle,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match bus.subscribe(&channel).await {
            Ok(mut stream) => {
                tracing::info!(channel = %channel, "relay subscription open");
                backoff = INITIAL_BACKOFF;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!("relay subscriber stopped");
                            return;
                        }
                        next = stream.next() => match next {
                            Some(payload) => deliver(&hub, &origin, &payload).await,
                            None => {
                                tracing::warn!(channel = %channel, "relay subscription ended");
                                break;
                            }
                        },
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, channel = %channel, "relay subscribe failed");
            }
        }

        let delay = jittered(backoff);
        tracing::info!(delay_ms = delay.as_millis() as u64, "retrying relay subscription");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = next_backoff(backoff);
    }
    tracing::debug!("relay subscriber stopped");
}

async fn deliver(hub: &HubHandle, origin: &str, payload: &str) {
    let frame: RelayFrame = match serde_json::from_str(payload) {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(%err, "undecodable relay frame dropped");
            return;
        }
    };

    // Already delivered locally when it was published.
    if frame.origin == origin {
        return;
    }

    if let Err(err) = hub.relayed(frame.envelope).await {
        tracing::debug!(%err, "relayed envelope not delivered");
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Spread reconnect attempts by ±20%.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}
