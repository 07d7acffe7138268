//! Pub/sub transports carrying call signals between conversation members.
//!
//! A transport delivers every published message to all *other* current
//! subscribers of the topic. Delivery is best-effort: no acknowledgement and
//! no replay for late subscribers.

pub mod memory;
pub mod websocket;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One message received on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
pub type Subscription = mpsc::UnboundedReceiver<Envelope>;

#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Publish to everyone else subscribed to `topic`. Fails when the
    /// transport is currently unreachable; nothing is queued for later.
    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}
