//! In-process transport: every client of one hub sees every other client's
//! messages. Used for the demo and tests; can be taken offline to simulate
//! lost signals.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{Envelope, SignalTransport, Subscription};

const HUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Frame {
    origin: u64,
    envelope: Envelope,
}

/// Shared message hub.
#[derive(Clone)]
pub struct MemoryHub {
    tx: broadcast::Sender<Frame>,
    next_client: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A new client connection to this hub.
    pub fn client(&self) -> MemoryBus {
        MemoryBus {
            id: self.next_client.fetch_add(1, Ordering::SeqCst),
            hub: self.clone(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryBus {
    id: u64,
    hub: MemoryHub,
    online: Arc<AtomicBool>,
}

impl MemoryBus {
    /// While offline, publishes fail and nothing is received.
    #[cfg(test)]
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalTransport for MemoryBus {
    async fn publish(&self, topic: &str, event: &str, payload: serde_json::Value) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            bail!("memory bus client {} is offline", self.id);
        }
        let frame = Frame {
            origin: self.id,
            envelope: Envelope {
                topic: topic.to_string(),
                event: event.to_string(),
                payload,
            },
        };
        // No receivers is not an error: nobody else is listening.
        let _ = self.hub.tx.send(frame);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut rx = self.hub.tx.subscribe();
        let (tx, out) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        let id = self.id;
        let online = self.online.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.origin == id
                            || frame.envelope.topic != topic
                            || !online.load(Ordering::SeqCst)
                        {
                            continue;
                        }
                        if tx.send(frame.envelope).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Memory bus subscriber on {} lagged, {} messages lost", topic, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(out)
    }
}
