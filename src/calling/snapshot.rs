//! Observable call state, as handed to a UI.

use chrono::{DateTime, Utc};

use super::rtc::StreamHandle;
use super::{CallDirection, CallState, CallType};

/// Why the last call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Hung up locally.
    Local,
    /// The peer hung up.
    Remote,
    /// The peer declined, or was busy.
    Declined,
    ConnectionLost,
    /// Nobody answered before the setup timeout.
    Unanswered,
    /// Negotiation broke down after setup.
    Failed,
}

/// User-facing notice about something that went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    SetupFailed(String),
    Unanswered,
    CameraUnavailable(String),
    ScreenShareUnavailable(String),
}

impl std::fmt::Display for CallNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallNotice::SetupFailed(reason) => write!(f, "Call failed: {}", reason),
            CallNotice::Unanswered => f.write_str("No answer"),
            CallNotice::CameraUnavailable(reason) => write!(f, "Camera unavailable: {}", reason),
            CallNotice::ScreenShareUnavailable(reason) => {
                write!(f, "Screen sharing unavailable: {}", reason)
            }
        }
    }
}

/// Point-in-time view of the engine. Media flags are derived from the
/// actual tracks, never stored separately.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<String>,
    pub conversation_id: Option<String>,
    pub call_type: Option<CallType>,
    pub peer_id: Option<String>,
    pub direction: Option<CallDirection>,
    pub has_video: bool,
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_screen_sharing: bool,
    pub duration_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub local_stream: Option<StreamHandle>,
    pub remote_stream: Option<StreamHandle>,
    pub remote_has_video: bool,
    pub end_reason: Option<EndReason>,
    pub notice: Option<CallNotice>,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            conversation_id: None,
            call_type: None,
            peer_id: None,
            direction: None,
            has_video: false,
            is_muted: false,
            is_camera_off: true,
            is_screen_sharing: false,
            duration_seconds: 0,
            started_at: None,
            local_stream: None,
            remote_stream: None,
            remote_has_video: false,
            end_reason: None,
            notice: None,
        }
    }
}

impl CallSnapshot {
    /// Label for the call screen.
    pub fn status_text(&self) -> String {
        match self.state {
            CallState::Idle => String::new(),
            CallState::Calling => "Calling...".to_string(),
            CallState::Ringing => "Incoming call".to_string(),
            CallState::Active => format_duration(self.duration_seconds),
            CallState::Ended => match self.end_reason {
                Some(EndReason::ConnectionLost) => "Connection lost".to_string(),
                _ => "Call ended".to_string(),
            },
        }
    }
}

/// `mm:ss`, growing to `h:mm:ss` past the hour.
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
