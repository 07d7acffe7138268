//! Signal channel for one conversation.
//!
//! Wraps a [`SignalTransport`] topic: `send` is fire-and-forget and never
//! fails the caller, `on_signal` subscribes once and hands every decoded
//! signal to a single handler. The subscription lives as long as the
//! channel, independent of call state, so nothing is lost mid-transition.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;

use super::signaling::{channel_topic, Signal, SIGNAL_EVENT};
use crate::bus::SignalTransport;

pub struct SignalChannel {
    transport: Arc<dyn SignalTransport>,
    topic: String,
    pump: Option<JoinHandle<()>>,
}

impl SignalChannel {
    pub fn new(transport: Arc<dyn SignalTransport>, conversation_id: &str) -> Self {
        Self {
            transport,
            topic: channel_topic(conversation_id),
            pump: None,
        }
    }

    /// Publish a signal. Transport failures are logged and swallowed.
    pub async fn send(&self, signal: &Signal) {
        let payload = match serde_json::to_value(signal) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to encode {} signal: {}", signal.kind(), e);
                return;
            }
        };
        tracing::debug!(
            "Signal out [{}] {} call={}",
            self.topic,
            signal.kind(),
            signal.call_id()
        );
        if let Err(e) = self.transport.publish(&self.topic, SIGNAL_EVENT, payload).await {
            tracing::warn!(
                "Dropped {} signal for call {}: {:#}",
                signal.kind(),
                signal.call_id(),
                e
            );
        }
    }

    /// Register the one handler for inbound signals.
    pub async fn on_signal<F>(&mut self, handler: F) -> Result<()>
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        if self.pump.is_some() {
            bail!("signal handler already registered for {}", self.topic);
        }
        let mut sub = self.transport.subscribe(&self.topic).await?;
        let topic = self.topic.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(envelope) = sub.recv().await {
                if envelope.event != SIGNAL_EVENT {
                    continue;
                }
                match serde_json::from_value::<Signal>(envelope.payload) {
                    Ok(signal) => {
                        tracing::debug!(
                            "Signal in [{}] {} call={}",
                            topic,
                            signal.kind(),
                            signal.call_id()
                        );
                        handler(signal);
                    }
                    Err(e) => tracing::debug!("Ignoring malformed signal on {}: {}", topic, e),
                }
            }
            tracing::debug!("Signal subscription on {} closed", topic);
        }));
        tracing::info!("Subscribed to {}", self.topic);
        Ok(())
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        if let Some(h) = self.pump.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryHub;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_signals_flow_between_members() {
        let hub = MemoryHub::new();
        let mut a = SignalChannel::new(Arc::new(hub.client()), "c1");
        let mut b = SignalChannel::new(Arc::new(hub.client()), "c1");
        assert_eq!(a.topic, "calls:c1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on_signal(move |s| {
            let _ = tx.send(s);
        })
        .await
        .unwrap();
        let (self_tx, mut self_rx) = mpsc::unbounded_channel();
        a.on_signal(move |s| {
            let _ = self_tx.send(s);
        })
        .await
        .unwrap();

        a.send(&Signal::CallEnd { call_id: "x".into() }).await;
        assert_eq!(rx.recv().await.unwrap(), Signal::CallEnd { call_id: "x".into() });
        tokio::task::yield_now().await;
        assert!(self_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_handler_rejected() {
        let hub = MemoryHub::new();
        let mut ch = SignalChannel::new(Arc::new(hub.client()), "c1");
        ch.on_signal(|_| {}).await.unwrap();
        assert!(ch.on_signal(|_| {}).await.is_err());
    }

    #[tokio::test]
    async fn test_send_survives_offline_transport() {
        let hub = MemoryHub::new();
        let bus = hub.client();
        bus.set_online(false);
        let ch = SignalChannel::new(Arc::new(bus), "c1");
        ch.send(&Signal::CallDecline { call_id: "y".into() }).await;
    }

    #[tokio::test]
    async fn test_malformed_payloads_skipped() {
        let hub = MemoryHub::new();
        let raw = hub.client();
        let mut ch = SignalChannel::new(Arc::new(hub.client()), "c1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.on_signal(move |s| {
            let _ = tx.send(s);
        })
        .await
        .unwrap();

        raw.publish("calls:c1", SIGNAL_EVENT, serde_json::json!({"type": "bogus"}))
            .await
            .unwrap();
        raw.publish("calls:c1", "presence", serde_json::json!({"type": "call-end", "callId": "z"}))
            .await
            .unwrap();
        raw.publish("calls:c1", SIGNAL_EVENT, serde_json::json!({"type": "call-end", "callId": "ok"}))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().call_id(), "ok");
    }
}
