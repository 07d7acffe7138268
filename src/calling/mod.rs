//! Call signaling engine: the call lifecycle state machine and what it
//! drives (signal protocol, media orchestration, ringing).
//!
//! The media engine itself (capture, codecs, ICE transport) is external and
//! reached through the capability traits in [`rtc`].

#[cfg(feature = "audio")]
pub mod audio;
pub mod channel;
pub mod demo;
pub mod ice;
pub mod machine;
pub mod media;
pub mod records;
pub mod rtc;
pub mod sdp;
pub mod signaling;
pub mod sim;
pub mod snapshot;
pub mod tone;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared call type. Fixed at call creation even if video is added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    /// Whether the camera is captured when the call is set up.
    pub fn wants_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Calling,
    Ringing,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side initiated the live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Failures the state machine has to classify.
///
/// Only setup failures reach the user; the rest are absorbed by falling back
/// to a safe state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("screen share unavailable: {0}")]
    ScreenShareUnavailable(String),

    #[error("peer connection failed: {0}")]
    Connection(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_wire_names() {
        assert_eq!(serde_json::to_string(&CallType::Video).unwrap(), "\"video\"");
        let t: CallType = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(t, CallType::Audio);
        assert!(!t.wants_video());
    }

    #[test]
    fn test_call_error_display() {
        let e = CallError::MediaUnavailable("permission denied".into());
        assert_eq!(e.to_string(), "media unavailable: permission denied");
    }
}
