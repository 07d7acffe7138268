//! WebSocket pub/sub transport.
//!
//! Speaks a small JSON framing against a broadcast relay:
//! `{"topic","event","payload","sender"}`. Topics are joined with a
//! `join` event, a `heartbeat` keeps idle connections alive, and the
//! connection is re-established with exponential backoff (1s, 2s, 4s, ...
//! capped at 64s), re-joining every topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Envelope, SignalTransport, Subscription};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BACKOFF_SECS: u64 = 64;

type Subscribers = Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
}

impl WireFrame {
    fn join(topic: &str, sender: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "join".into(),
            payload: serde_json::json!({}),
            sender: Some(sender.to_string()),
        }
    }

    fn heartbeat(sender: &str) -> Self {
        Self {
            topic: "heartbeat".into(),
            event: "heartbeat".into(),
            payload: serde_json::json!({}),
            sender: Some(sender.to_string()),
        }
    }

    fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode frame")
    }
}

/// WebSocket client; one per process is enough for any number of topics.
pub struct WsBus {
    client_id: String,
    outgoing: mpsc::UnboundedSender<String>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WsBus {
    /// Start connecting to `url` in the background.
    pub fn connect(url: &str) -> Result<Self> {
        let url = url::Url::parse(url).with_context(|| format!("Invalid signaling URL {}", url))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => bail!("Signaling URL must be ws:// or wss://, got {}://", other),
        }

        let client_id = uuid::Uuid::new_v4().to_string();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(connection_loop(
            url,
            client_id.clone(),
            outgoing_rx,
            subscribers.clone(),
            connected.clone(),
        ));

        Ok(Self {
            client_id,
            outgoing,
            subscribers,
            connected,
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl SignalTransport for WsBus {
    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        if !self.is_connected() {
            bail!("signaling relay not connected");
        }
        let frame = WireFrame {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            sender: Some(self.client_id.clone()),
        };
        self.outgoing
            .send(frame.encode()?)
            .map_err(|_| anyhow!("signaling connection task stopped"))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Joins made while disconnected go out on the next connect.
        if add_subscriber(&self.subscribers, &self.connected, topic, tx) {
            let join = WireFrame::join(topic, &self.client_id).encode()?;
            let _ = self.outgoing.send(join);
        }
        Ok(rx)
    }
}

/// Keep a connection up until the bus is dropped.
async fn connection_loop(
    url: url::Url,
    client_id: String,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = 1u64;
    loop {
        match run_connection(&url, &client_id, &mut outgoing, &subscribers, &connected).await {
            Ok(()) => return,
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                tracing::warn!(
                    "Signaling relay disconnected: {:#}. Reconnecting in {}s...",
                    e,
                    backoff
                );
                time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

/// One connection lifetime. `Ok` means the bus was dropped.
async fn run_connection(
    url: &url::Url,
    client_id: &str,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    subscribers: &Subscribers,
    connected: &AtomicBool,
) -> Result<()> {
    tracing::info!("Connecting to signaling relay {}", url);
    let (mut stream, response) = connect_async(url.as_str())
        .await
        .context("WebSocket connection failed")?;
    tracing::info!("Signaling relay connected (status={})", response.status());

    for topic in mark_connected(subscribers, connected) {
        let join = WireFrame::join(&topic, client_id).encode()?;
        stream
            .send(Message::Text(join))
            .await
            .context("Failed to join topic")?;
    }

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    let result = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(text) => {
                    tracing::debug!("WS send: {}", text);
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        break Err(anyhow::Error::new(e).context("Failed to send frame"));
                    }
                }
                None => break Ok(()),
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch(&text, client_id, subscribers),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        break Err(anyhow::Error::new(e).context("Failed to send pong"));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    break Err(anyhow!("WebSocket closed by server"));
                }
                Some(Ok(other)) => tracing::debug!("WS frame (ignored): {:?}", other),
                Some(Err(e)) => break Err(anyhow::Error::new(e).context("WebSocket receive error")),
                None => break Err(anyhow!("WebSocket stream ended")),
            },
            _ = heartbeat.tick() => {
                let beat = WireFrame::heartbeat(client_id).encode()?;
                if let Err(e) = stream.send(Message::Text(beat)).await {
                    break Err(anyhow::Error::new(e).context("Heartbeat send failed"));
                }
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    result
}

/// Register a subscriber. Returns true when the caller must send the join
/// itself: first subscriber for the topic on a live connection.
fn add_subscriber(
    subscribers: &Subscribers,
    connected: &AtomicBool,
    topic: &str,
    tx: mpsc::UnboundedSender<Envelope>,
) -> bool {
    let mut subs = lock(subscribers);
    let entry = subs.entry(topic.to_string()).or_default();
    entry.push(tx);
    entry.len() == 1 && connected.load(Ordering::SeqCst)
}

/// Flip to connected and return the topics the new connection must join.
/// Both happen under the subscriber lock, so every topic is joined exactly
/// once: here, or by `add_subscriber`'s caller.
fn mark_connected(subscribers: &Subscribers, connected: &AtomicBool) -> Vec<String> {
    let subs = lock(subscribers);
    connected.store(true, Ordering::SeqCst);
    subs.keys().cloned().collect()
}

/// Route a received frame to the topic's subscribers.
fn dispatch(text: &str, client_id: &str, subscribers: &Subscribers) {
    tracing::debug!("WS recv: {}", text);
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("Ignoring undecodable frame: {}", e);
            return;
        }
    };
    if frame.sender.as_deref() == Some(client_id) {
        return;
    }
    if matches!(frame.event.as_str(), "join" | "heartbeat" | "reply") {
        return;
    }

    let mut subs = lock(subscribers);
    if let Some(list) = subs.get_mut(&frame.topic) {
        let envelope = Envelope {
            topic: frame.topic.clone(),
            event: frame.event.clone(),
            payload: frame.payload.clone(),
        };
        list.retain(|tx| tx.send(envelope.clone()).is_ok());
    }
}
