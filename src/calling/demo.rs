//! Two engines calling each other in-process.
//!
//! Alice and Bob share an in-memory bus and the simulated media engine, so
//! the whole lifecycle (offer, ringing, answer, optional screen share,
//! hangup, settle back to idle) runs without a network or devices.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time;

use super::machine::{self, CallHandle, EngineConfig};
use super::records::{LogEntry, MemoryCallLog};
use super::sim::SimEngine;
use super::snapshot::CallSnapshot;
use super::tone::NullSink;
use super::{CallState, CallType};
use crate::bus::memory::MemoryHub;

const CONVERSATION: &str = "demo-conversation";
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub video: bool,
    pub screen_share: bool,
    /// How long the call stays up before Alice hangs up.
    pub talk_time: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            video: false,
            screen_share: false,
            talk_time: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Default)]
pub struct DemoResult {
    pub connected: bool,
    pub duration_seconds: u64,
    pub screen_shared: bool,
    pub caller_transitions: Vec<String>,
    pub callee_transitions: Vec<String>,
    pub record_writes: usize,
}

struct Party {
    name: &'static str,
    handle: CallHandle,
    task: JoinHandle<()>,
    printer: JoinHandle<Vec<String>>,
}

impl Party {
    async fn spawn(hub: &MemoryHub, name: &'static str, log: Arc<MemoryCallLog>) -> Result<Self> {
        let (handle, task) = machine::spawn(
            EngineConfig::new(name, CONVERSATION),
            Arc::new(hub.client()),
            Arc::new(SimEngine::new()),
            log,
            Arc::new(NullSink),
        )
        .await
        .with_context(|| format!("Failed to start engine for {}", name))?;
        let printer = tokio::spawn(print_transitions(name, handle.clone()));
        Ok(Self {
            name,
            handle,
            task,
            printer,
        })
    }

    async fn wait_for(
        &self,
        what: &str,
        pred: impl FnMut(&CallSnapshot) -> bool,
    ) -> Result<CallSnapshot> {
        let mut rx = self.handle.watch();
        let snap = time::timeout(STEP_TIMEOUT, rx.wait_for(pred))
            .await
            .with_context(|| format!("{} never reached {}", self.name, what))?
            .context("Call engine stopped")?;
        Ok(snap.clone())
    }

    async fn wait_state(&self, state: CallState) -> Result<CallSnapshot> {
        self.wait_for(state.as_str(), |s| s.state == state).await
    }

    /// Stop the engine and collect the transitions it printed.
    async fn finish(self) -> Result<Vec<String>> {
        self.handle.shutdown()?;
        self.task.await.context("Engine task panicked")?;
        self.printer.await.context("Printer task panicked")
    }
}

/// Print every state change of one engine until it stops.
async fn print_transitions(name: &'static str, handle: CallHandle) -> Vec<String> {
    let mut updates = handle.updates();
    let mut last = CallState::Idle;
    let mut seen = Vec::new();
    while let Some(snap) = updates.next().await {
        if snap.state != last {
            let line = format!("{} -> {}", last, snap.state);
            println!("[{:<5}] {:<20} {}", name, line, snap.status_text());
            seen.push(line);
            last = snap.state;
        }
        if let Some(notice) = &snap.notice {
            tracing::debug!("[{}] notice: {}", name, notice);
        }
    }
    seen
}

/// Run one complete call between two in-process engines.
pub async fn run_demo(options: DemoOptions) -> Result<DemoResult> {
    let call_type = if options.video {
        CallType::Video
    } else {
        CallType::Audio
    };

    println!();
    println!("=== Call Demo ({} call) ===", call_type);
    println!("Caller:       alice");
    println!("Callee:       bob");
    println!("Conversation: {}", CONVERSATION);
    println!();

    let hub = MemoryHub::new();
    let log = Arc::new(MemoryCallLog::default());
    let alice = Party::spawn(&hub, "alice", log.clone()).await?;
    let bob = Party::spawn(&hub, "bob", log.clone()).await?;

    let mut result = DemoResult::default();

    alice.handle.start("bob", call_type)?;
    bob.wait_state(CallState::Ringing).await?;
    bob.handle.answer()?;
    alice.wait_state(CallState::Active).await?;
    bob.wait_state(CallState::Active).await?;
    result.connected = true;

    if options.screen_share {
        alice.handle.toggle_screen_share()?;
        alice.wait_for("screen share", |s| s.is_screen_sharing).await?;
        result.screen_shared = true;
        time::sleep(options.talk_time / 2).await;
        alice.handle.toggle_screen_share()?;
        alice
            .wait_for("screen share stop", |s| !s.is_screen_sharing)
            .await?;
        time::sleep(options.talk_time / 2).await;
    } else {
        time::sleep(options.talk_time).await;
    }

    result.duration_seconds = alice.handle.snapshot().duration_seconds;
    alice.handle.end()?;
    alice.wait_state(CallState::Ended).await?;
    bob.wait_state(CallState::Ended).await?;
    alice.wait_state(CallState::Idle).await?;
    bob.wait_state(CallState::Idle).await?;

    result.caller_transitions = alice.finish().await?;
    result.callee_transitions = bob.finish().await?;
    result.record_writes = log.entries().len();

    println!();
    println!("call_connected={}", result.connected);
    println!("duration_seconds={}", result.duration_seconds);
    println!("screen_shared={}", result.screen_shared);
    println!("record_writes={}", result.record_writes);
    for entry in log.entries() {
        match entry {
            LogEntry::Insert(record) => {
                tracing::debug!("record insert {} ({})", record.id, record.call_type)
            }
            LogEntry::Update(id, update) => {
                tracing::debug!("record update {} -> {:?}", id, update.status)
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_audio_demo_runs_full_lifecycle() {
        let result = run_demo(DemoOptions::default()).await.unwrap();
        assert!(result.connected);
        assert!(!result.screen_shared);
        assert!(result.duration_seconds >= 2);
        assert_eq!(
            result.caller_transitions,
            vec!["idle -> calling", "calling -> active", "active -> ended", "ended -> idle"]
        );
        assert_eq!(
            result.callee_transitions,
            vec!["idle -> ringing", "ringing -> active", "active -> ended", "ended -> idle"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_demo_with_screen_share() {
        let result = run_demo(DemoOptions {
            video: true,
            screen_share: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(result.connected);
        assert!(result.screen_shared);
        assert_eq!(result.caller_transitions.last().unwrap(), "ended -> idle");
    }
}
