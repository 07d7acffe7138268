//! Capability contract with the external media / peer-connection engine.
//!
//! The engine captures local tracks and implements offer/answer, ICE and
//! media transport. The call engine only drives it through these traits;
//! `sim::SimEngine` is the in-process implementation used by the CLI demo
//! and tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::CallError;

/// Public connectivity-assist servers used when none are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Where a local track comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
    DisplayAudio,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// A captured local media track. Clones share the same underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, source: TrackSource) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Stop capture. Idempotent; also used by engines to signal that the
    /// source went away on its own (e.g. sharing stopped from OS chrome).
    pub fn stop(&self) {
        self.inner.ended.send_replace(true);
        self.set_enabled(false);
    }

    /// Resolves once the track has ended, for whatever reason.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A set of local tracks returned by one capture request.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Handle a UI uses to render a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

// ---------------------------------------------------------------------------
// Negotiation data (also carried on the wire inside signals)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One connectivity candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

// ---------------------------------------------------------------------------
// Peer connection contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Transitions that end the call.
    pub fn is_lost(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Outgoing transport slot on a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u32);

/// Notifications raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    RemoteTrack {
        track_id: String,
        kind: MediaKind,
        stream_id: String,
    },
    LocalCandidate(IceCandidateInit),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl RtcConfig {
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls
                .into_iter()
                .map(|u| IceServer {
                    urls: vec![u.into()],
                })
                .collect(),
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self::from_urls(DEFAULT_ICE_SERVERS)
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local track on a new outgoing slot.
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId>;

    /// Provision an empty outgoing slot so a track can be swapped in later.
    async fn add_transceiver(&self, kind: MediaKind) -> Result<SenderId>;

    /// Swap the content of a slot without renegotiating. `None` sends nothing.
    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<()>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Applying a remote offer while a local offer is pending rolls the
    /// local offer back.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn has_remote_description(&self) -> bool;

    fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Microphone (and camera when `video`) capture.
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<LocalStream, CallError>;

    /// Display capture; may carry an audio track.
    async fn get_display_media(&self) -> Result<LocalStream, CallError>;

    async fn create_peer_connection(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
