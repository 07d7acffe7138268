//! Best-effort call record log.
//!
//! Records are an audit trail only; the live call never waits on them.
//! Writes go through a [`Recorder`] that applies them in order on a
//! background task and logs failures.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::CallType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Declined,
    Ended,
    Missed,
}

/// Row inserted when a call is placed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub id: String,
    pub conversation_id: String,
    pub caller_id: String,
    pub callee_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
}

/// Partial update; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallRecordUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl CallRecordUpdate {
    pub fn answered() -> Self {
        Self {
            status: Some(CallStatus::Active),
            started_at: Some(now_rfc3339()),
            ended_at: None,
        }
    }

    pub fn finished(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            started_at: None,
            ended_at: Some(now_rfc3339()),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
pub trait CallLog: Send + Sync {
    async fn insert(&self, record: &CallRecord) -> Result<()>;
    async fn update(&self, id: &str, update: &CallRecordUpdate) -> Result<()>;
}

/// Used when no record store is configured.
pub struct NullCallLog;

#[async_trait]
impl CallLog for NullCallLog {
    async fn insert(&self, _record: &CallRecord) -> Result<()> {
        Ok(())
    }

    async fn update(&self, _id: &str, _update: &CallRecordUpdate) -> Result<()> {
        Ok(())
    }
}

/// PostgREST-style `calls` table over HTTP.
pub struct RestCallLog {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestCallLog {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => req.header("apikey", key).bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl CallLog for RestCallLog {
    async fn insert(&self, record: &CallRecord) -> Result<()> {
        let url = format!("{}/calls", self.base_url);
        tracing::debug!("Call log POST {}", url);
        let resp = self
            .authorize(self.http.post(&url))
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .with_context(|| format!("Call log POST {} failed", url))?;
        check_response(resp, &url).await
    }

    async fn update(&self, id: &str, update: &CallRecordUpdate) -> Result<()> {
        let url = format!("{}/calls?id=eq.{}", self.base_url, id);
        tracing::debug!("Call log PATCH {}", url);
        let resp = self
            .authorize(self.http.patch(&url))
            .header("Prefer", "return=minimal")
            .json(update)
            .send()
            .await
            .with_context(|| format!("Call log PATCH {} failed", url))?;
        check_response(resp, &url).await
    }
}

async fn check_response(resp: reqwest::Response, url: &str) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(())
}

/// One applied write, as kept by [`MemoryCallLog`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Insert(CallRecord),
    Update(String, CallRecordUpdate),
}

/// Keeps writes in memory (demo and tests).
#[derive(Default)]
pub struct MemoryCallLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryCallLog {
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn insert(&self, record: &CallRecord) -> Result<()> {
        self.push(LogEntry::Insert(record.clone()));
        Ok(())
    }

    async fn update(&self, id: &str, update: &CallRecordUpdate) -> Result<()> {
        self.push(LogEntry::Update(id.to_string(), update.clone()));
        Ok(())
    }
}

/// Ordered, non-blocking front end to a [`CallLog`].
pub struct Recorder {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl Recorder {
    pub fn spawn(log: Arc<dyn CallLog>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                let result = match entry {
                    LogEntry::Insert(ref record) => log.insert(record).await,
                    LogEntry::Update(ref id, ref update) => log.update(id, update).await,
                };
                if let Err(e) = result {
                    tracing::warn!("Call record write failed (ignored): {:#}", e);
                }
            }
        });
        Self { tx }
    }

    pub fn insert(&self, record: CallRecord) {
        let _ = self.tx.send(LogEntry::Insert(record));
    }

    pub fn update(&self, id: &str, update: CallRecordUpdate) {
        let _ = self.tx.send(LogEntry::Update(id.to_string(), update));
    }
}
