//! Wire protocol between the two parties of a call.
//!
//! Signals are JSON objects tagged by `type` and published as the
//! `webrtc-signal` event on the conversation's `calls:<conversationId>`
//! topic. Every variant carries the `callId` it belongs to.

use serde::{Deserialize, Serialize};

use super::rtc::{IceCandidateInit, SessionDescription};
use super::CallType;

/// Event name signals are published under.
pub const SIGNAL_EVENT: &str = "webrtc-signal";

/// Pub/sub topic for a conversation's call signals.
pub fn channel_topic(conversation_id: &str) -> String {
    format!("calls:{}", conversation_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Proposes a session, or renegotiates an existing one.
    #[serde(rename_all = "camelCase")]
    Offer {
        sdp: SessionDescription,
        call_id: String,
        caller_id: String,
        callee_id: String,
        call_type: CallType,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sdp: SessionDescription,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: IceCandidateInit,
        call_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CallEnd { call_id: String },
    /// Refused by the callee, or automatically because they were busy.
    #[serde(rename_all = "camelCase")]
    CallDecline { call_id: String },
}

impl Signal {
    pub fn call_id(&self) -> &str {
        match self {
            Signal::Offer { call_id, .. }
            | Signal::Answer { call_id, .. }
            | Signal::IceCandidate { call_id, .. }
            | Signal::CallEnd { call_id }
            | Signal::CallDecline { call_id } => call_id,
        }
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::CallEnd { .. } => "call-end",
            Signal::CallDecline { .. } => "call-decline",
        }
    }
}
