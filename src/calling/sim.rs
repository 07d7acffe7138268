//! In-process media engine with no real devices or network.
//!
//! Models what the call engine observes from a native WebRTC stack: local
//! tracks, an offer/answer signaling state, candidate gathering after the
//! local description is set, remote track arrival and connection state.
//! Knobs in [`SimOptions`] reproduce the failure modes the call engine must
//! absorb (denied permissions, failed camera reacquisition, unsupported
//! track replacement, lost connectivity, sharing stopped from OS chrome).

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ice::{self, Candidate, CandidateType};
use super::rtc::{
    ConnectionState, IceCandidateInit, LocalStream, LocalTrack, MediaEngine, MediaKind,
    PeerConnection, PeerEvent, RtcConfig, SdpType, SenderId, SessionDescription, SignalingState,
    TrackSource,
};
use super::sdp::{self, Direction, MediaSection, SdpParams};
use super::CallError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour switches for the simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Microphone/camera permission denied.
    pub deny_user_media: bool,
    /// Camera capture fails but the microphone works.
    pub deny_camera: bool,
    /// Display capture refused.
    pub deny_display: bool,
    /// Display capture includes an audio track.
    pub display_audio: bool,
    /// `replace_track` is not implemented by the engine.
    pub replace_unsupported: bool,
}

/// Simulated media engine. Cheap to clone handles via `Arc`.
pub struct SimEngine {
    host: String,
    options: Mutex<SimOptions>,
    connections: Mutex<Vec<Arc<SimPeerConnection>>>,
    captured: Mutex<Vec<LocalTrack>>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::with_options(SimOptions::default())
    }

    pub fn with_options(options: SimOptions) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            options: Mutex::new(options),
            connections: Mutex::new(Vec::new()),
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn update_options(&self, f: impl FnOnce(&mut SimOptions)) {
        f(&mut lock(&self.options));
    }

    /// Most recently created peer connection.
    pub fn last_connection(&self) -> Option<Arc<SimPeerConnection>> {
        lock(&self.connections).last().cloned()
    }

    /// Every track ever captured, in capture order.
    pub fn captured_tracks(&self) -> Vec<LocalTrack> {
        lock(&self.captured).clone()
    }

    /// Tracks still capturing.
    pub fn live_tracks(&self) -> Vec<LocalTrack> {
        lock(&self.captured)
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect()
    }

    /// End the active display capture as if the user stopped it from the OS.
    pub fn end_display_capture(&self) -> bool {
        let captured = lock(&self.captured);
        let mut ended = false;
        for track in captured
            .iter()
            .filter(|t| t.source() == TrackSource::Display && t.is_live())
        {
            track.stop();
            ended = true;
        }
        ended
    }

    /// Report the latest connection as failed.
    pub fn fail_connection(&self) {
        if let Some(pc) = self.last_connection() {
            pc.report(ConnectionState::Failed);
        }
    }

    fn capture(&self, tracks: Vec<LocalTrack>) -> LocalStream {
        lock(&self.captured).extend(tracks.iter().cloned());
        LocalStream::new(tracks)
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for SimEngine {
    async fn get_user_media(&self, audio: bool, video: bool) -> Result<LocalStream, CallError> {
        let options = lock(&self.options).clone();
        if options.deny_user_media {
            return Err(CallError::MediaUnavailable(
                "permission denied by user".into(),
            ));
        }
        if video && options.deny_camera {
            return Err(CallError::MediaUnavailable("no camera found".into()));
        }

        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, TrackSource::Microphone));
        }
        if video {
            tracks.push(LocalTrack::new(MediaKind::Video, TrackSource::Camera));
        }
        Ok(self.capture(tracks))
    }

    async fn get_display_media(&self) -> Result<LocalStream, CallError> {
        let options = lock(&self.options).clone();
        if options.deny_display {
            return Err(CallError::ScreenShareUnavailable(
                "display capture refused".into(),
            ));
        }

        let mut tracks = vec![LocalTrack::new(MediaKind::Video, TrackSource::Display)];
        if options.display_audio {
            tracks.push(LocalTrack::new(MediaKind::Audio, TrackSource::DisplayAudio));
        }
        Ok(self.capture(tracks))
    }

    async fn create_peer_connection(
        &self,
        config: &RtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if config.ice_servers.is_empty() {
            tracing::debug!("Simulated connection without ICE servers (host candidates only)");
        }
        let options = lock(&self.options).clone();
        let pc = Arc::new(SimPeerConnection::new(
            self.host.clone(),
            !options.replace_unsupported,
            events,
        ));
        lock(&self.connections).push(pc.clone());
        Ok(pc)
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

struct SimSender {
    kind: MediaKind,
    track: Option<LocalTrack>,
    removed: bool,
}

struct PcState {
    signaling: SignalingState,
    connection: ConnectionState,
    senders: Vec<SimSender>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    version: u64,
    gathered: bool,
    announced: HashSet<String>,
    applied: Vec<IceCandidateInit>,
    offers_created: u32,
}

/// Simulated peer connection; inspection methods are for tests and the demo.
pub struct SimPeerConnection {
    host: String,
    session_id: u64,
    stream_id: String,
    ufrag: String,
    pwd: String,
    replace_supported: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PcState>,
}

impl SimPeerConnection {
    fn new(host: String, replace_supported: bool, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        let id = uuid::Uuid::new_v4();
        let bytes = id.as_bytes();
        let session_id = u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) >> 1;
        Self {
            host,
            session_id,
            stream_id: uuid::Uuid::new_v4().to_string(),
            ufrag: sdp::generate_ice_ufrag(),
            pwd: sdp::generate_ice_pwd(),
            replace_supported,
            events,
            state: Mutex::new(PcState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                senders: Vec::new(),
                local: None,
                remote: None,
                version: 0,
                gathered: false,
                announced: HashSet::new(),
                applied: Vec::new(),
                offers_created: 0,
            }),
        }
    }

    /// Candidates applied from the remote side, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidateInit> {
        lock(&self.state).applied.clone()
    }

    pub fn offers_created(&self) -> u32 {
        lock(&self.state).offers_created
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).signaling == SignalingState::Closed
    }

    /// Tracks currently sent, per slot.
    pub fn sending(&self) -> Vec<(MediaKind, Option<TrackSource>)> {
        lock(&self.state)
            .senders
            .iter()
            .filter(|s| !s.removed)
            .map(|s| (s.kind, s.track.as_ref().map(|t| t.source())))
            .collect()
    }

    fn report(&self, state: ConnectionState) {
        let changed = {
            let mut st = lock(&self.state);
            if st.connection == state || st.signaling == SignalingState::Closed {
                false
            } else {
                st.connection = state;
                true
            }
        };
        if changed {
            let _ = self.events.send(PeerEvent::ConnectionState(state));
        }
    }

    fn describe(&self, st: &mut PcState) -> String {
        st.version += 1;
        let sections: Vec<MediaSection> = st
            .senders
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.removed)
            .map(|(i, s)| MediaSection {
                kind: s.kind,
                mid: i.to_string(),
                direction: if s.track.is_some() {
                    Direction::SendRecv
                } else {
                    Direction::RecvOnly
                },
                track_id: s.track.as_ref().map(|t| t.id().to_string()),
            })
            .collect();
        sdp::write(&SdpParams {
            session_id: self.session_id,
            version: st.version,
            host: &self.host,
            stream_id: &self.stream_id,
            ice_ufrag: &self.ufrag,
            ice_pwd: &self.pwd,
            sections: &sections,
        })
    }

    /// Host and server-reflexive candidates, emitted once per connection.
    fn gather(&self, st: &mut PcState) {
        if st.gathered {
            return;
        }
        st.gathered = true;
        let port = 40000 + (self.session_id % 20000) as u16;
        let host = Candidate::new(CandidateType::Host, &self.host, port);
        let mut srflx = Candidate::new(CandidateType::ServerReflexive, "203.0.113.10", port);
        srflx.related = Some((self.host.clone(), port));
        for c in [host, srflx] {
            let _ = self
                .events
                .send(PeerEvent::LocalCandidate(c.to_init("0", 0)));
        }
    }

    fn announce_remote_tracks(&self, st: &mut PcState, desc: &SessionDescription) -> Result<()> {
        let sections = sdp::parse_sections(&desc.sdp)?;
        // The remote side may have added slots; mirror them with receive-only ones.
        while st.senders.len() < sections.len() {
            let kind = sections[st.senders.len()].kind;
            st.senders.push(SimSender {
                kind,
                track: None,
                removed: false,
            });
        }
        for section in sections.iter().filter(|s| s.direction.sends()) {
            if let Some(ref track_id) = section.track_id {
                if st.announced.insert(track_id.clone()) {
                    let _ = self.events.send(PeerEvent::RemoteTrack {
                        track_id: track_id.clone(),
                        kind: section.kind,
                        stream_id: format!("remote-{}", self.session_id),
                    });
                }
            }
        }
        Ok(())
    }

    fn maybe_connect(&self, st: &PcState) -> bool {
        st.signaling == SignalingState::Stable
            && st.local.is_some()
            && st.remote.is_some()
            && st.connection == ConnectionState::New
    }

    fn sender_mut<'a>(st: &'a mut PcState, sender: SenderId) -> Result<&'a mut SimSender> {
        st.senders
            .get_mut(sender.0 as usize)
            .filter(|s| !s.removed)
            .with_context(|| format!("unknown sender {:?}", sender))
    }
}

#[async_trait]
impl PeerConnection for SimPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let mut st = lock(&self.state);
        if st.signaling == SignalingState::Closed {
            bail!("connection closed");
        }
        st.senders.push(SimSender {
            kind: track.kind(),
            track: Some(track.clone()),
            removed: false,
        });
        Ok(SenderId(st.senders.len() as u32 - 1))
    }

    async fn add_transceiver(&self, kind: MediaKind) -> Result<SenderId> {
        let mut st = lock(&self.state);
        if st.signaling == SignalingState::Closed {
            bail!("connection closed");
        }
        st.senders.push(SimSender {
            kind,
            track: None,
            removed: false,
        });
        Ok(SenderId(st.senders.len() as u32 - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<()> {
        if !self.replace_supported {
            bail!("replaceTrack is not supported by this engine");
        }
        let mut st = lock(&self.state);
        let slot = Self::sender_mut(&mut st, sender)?;
        if let Some(t) = track {
            if t.kind() != slot.kind {
                bail!("cannot put a {} track on a {} slot", t.kind().as_str(), slot.kind.as_str());
            }
        }
        slot.track = track.cloned();
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let mut st = lock(&self.state);
        let slot = Self::sender_mut(&mut st, sender)?;
        slot.track = None;
        slot.removed = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut st = lock(&self.state);
        match st.signaling {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {}
            other => bail!("cannot create offer in {:?}", other),
        }
        st.offers_created += 1;
        Ok(SessionDescription::offer(self.describe(&mut st)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut st = lock(&self.state);
        if st.signaling != SignalingState::HaveRemoteOffer {
            bail!("cannot create answer in {:?}", st.signaling);
        }
        Ok(SessionDescription::answer(self.describe(&mut st)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let connect = {
            let mut st = lock(&self.state);
            st.signaling = match (st.signaling, desc.kind) {
                (SignalingState::Stable, SdpType::Offer)
                | (SignalingState::HaveLocalOffer, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (state, kind) => bail!("cannot set local {:?} in {:?}", kind, state),
            };
            st.local = Some(desc);
            self.gather(&mut st);
            self.maybe_connect(&st)
        };
        if connect {
            self.report(ConnectionState::Connecting);
            self.report(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let connect = {
            let mut st = lock(&self.state);
            st.signaling = match (st.signaling, desc.kind) {
                (SignalingState::Stable, SdpType::Offer)
                | (SignalingState::HaveLocalOffer, SdpType::Offer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (state, kind) => bail!("cannot set remote {:?} in {:?}", kind, state),
            };
            self.announce_remote_tracks(&mut st, &desc)?;
            st.remote = Some(desc);
            self.maybe_connect(&st)
        };
        if connect {
            self.report(ConnectionState::Connecting);
            self.report(ConnectionState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        ice::parse(&candidate.candidate)?;
        let mut st = lock(&self.state);
        if st.remote.is_none() {
            bail!("remote description not set");
        }
        st.applied.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn has_remote_description(&self) -> bool {
        lock(&self.state).remote.is_some()
    }

    fn close(&self) {
        let mut st = lock(&self.state);
        st.signaling = SignalingState::Closed;
        st.connection = ConnectionState::Closed;
    }
}
