//! Media session controller.
//!
//! Owns the local tracks and the peer connection of one call and performs
//! every track operation the call needs: mute, camera toggles, screen share
//! and the candidate queue. Peer connection events are tagged with the call
//! id and forwarded to the owner's event channel, so events from a torn-down
//! connection can be told apart from the live one.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::rtc::{
    IceCandidateInit, LocalStream, LocalTrack, MediaEngine, MediaKind, PeerConnection, PeerEvent,
    RtcConfig, SenderId, SessionDescription, SignalingState, StreamHandle, TrackSource,
};
use super::{CallError, CallType};

/// Events surfaced to the owner of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Peer { call_id: String, event: PeerEvent },
    /// The shared screen was stopped outside the app.
    ScreenShareEnded { call_id: String, track_id: String },
}

/// Result of a track operation that may have changed the negotiated media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackChange {
    /// A new offer/answer round is needed.
    pub renegotiate: bool,
    /// The camera could not be reacquired; outgoing video fell back to none.
    pub camera_lost: bool,
}

struct ScreenShare {
    stream: LocalStream,
    audio_sender: Option<SenderId>,
    watcher: JoinHandle<()>,
    /// Camera state before sharing: `None` if there was no camera.
    camera_was_enabled: Option<bool>,
}

pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    rtc_config: RtcConfig,
    events: mpsc::UnboundedSender<MediaEvent>,
    call_id: Option<String>,
    local: Option<LocalStream>,
    camera: Option<LocalTrack>,
    pc: Option<Arc<dyn PeerConnection>>,
    audio_sender: Option<SenderId>,
    video_sender: Option<SenderId>,
    screen: Option<ScreenShare>,
    pending_candidates: VecDeque<IceCandidateInit>,
    remote: Option<StreamHandle>,
    forwarder: Option<JoinHandle<()>>,
}

impl MediaSession {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        rtc_config: RtcConfig,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Self {
        Self {
            engine,
            rtc_config,
            events,
            call_id: None,
            local: None,
            camera: None,
            pc: None,
            audio_sender: None,
            video_sender: None,
            screen: None,
            pending_candidates: VecDeque::new(),
            remote: None,
            forwarder: None,
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Capture the microphone, plus the camera for video calls.
    pub async fn acquire_local_media(&mut self, call_type: CallType) -> Result<(), CallError> {
        let stream = self
            .engine
            .get_user_media(true, call_type.wants_video())
            .await?;
        tracing::debug!(
            "Local media acquired: {} audio, {} video track(s)",
            stream.audio_tracks().count(),
            stream.video_tracks().count()
        );
        self.camera = stream.video_tracks().next().cloned();
        self.local = Some(stream);
        Ok(())
    }

    /// Create the peer connection for `call_id` and attach the local tracks.
    ///
    /// A video slot is always provisioned, empty for audio calls, so video
    /// can be swapped in later without renegotiating.
    pub async fn create_connection(&mut self, call_id: &str) -> Result<(), CallError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self
            .engine
            .create_peer_connection(&self.rtc_config, tx)
            .await
            .map_err(|e| CallError::Connection(format!("{:#}", e)))?;

        let events = self.events.clone();
        let tag = call_id.to_string();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = MediaEvent::Peer {
                    call_id: tag.clone(),
                    event,
                };
                if events.send(tagged).is_err() {
                    break;
                }
            }
        }));
        self.call_id = Some(call_id.to_string());
        self.pc = Some(pc.clone());

        let mic = self
            .local
            .as_ref()
            .and_then(|s| s.audio_tracks().next().cloned());
        if let Some(mic) = mic {
            let sender = pc.add_track(&mic).await.map_err(connection_error)?;
            self.audio_sender = Some(sender);
        }
        let sender = match self.camera {
            Some(ref camera) => pc.add_track(camera).await,
            None => pc.add_transceiver(MediaKind::Video).await,
        }
        .map_err(connection_error)?;
        self.video_sender = Some(sender);

        tracing::info!("Peer connection created for call {}", call_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Negotiation
    // -----------------------------------------------------------------------

    pub async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        let pc = self.connection()?;
        let offer = pc.create_offer().await.map_err(negotiation_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(offer)
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, CallError> {
        let pc = self.connection()?;
        let answer = pc.create_answer().await.map_err(negotiation_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(answer)
    }

    /// Offer or answer, whichever the signaling state calls for.
    pub async fn negotiate(&mut self) -> Result<SessionDescription, CallError> {
        if self.signaling_state() == Some(SignalingState::HaveRemoteOffer) {
            self.create_answer().await
        } else {
            self.create_offer().await
        }
    }

    /// Apply a remote description, then replay queued candidates in order.
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), CallError> {
        let pc = self.connection()?;
        pc.set_remote_description(desc)
            .await
            .map_err(negotiation_error)?;

        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Queued ICE candidate rejected: {:#}", e);
            }
        }
        if queued > 0 {
            tracing::debug!("Applied {} queued ICE candidate(s)", queued);
        }
        Ok(())
    }

    /// Apply a remote candidate now if possible, otherwise queue it.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidateInit) {
        match self.pc {
            Some(ref pc) if pc.has_remote_description() => {
                if let Err(e) = pc.add_ice_candidate(candidate).await {
                    tracing::warn!("ICE candidate rejected: {:#}", e);
                }
            }
            _ => self.pending_candidates.push_back(candidate),
        }
    }

    pub fn signaling_state(&self) -> Option<SignalingState> {
        self.pc.as_ref().map(|pc| pc.signaling_state())
    }

    /// A local offer is out and its answer has not been applied.
    pub fn awaiting_answer(&self) -> bool {
        self.signaling_state() == Some(SignalingState::HaveLocalOffer)
    }

    #[cfg(test)]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    // -----------------------------------------------------------------------
    // Local track control
    // -----------------------------------------------------------------------

    /// Flip the microphone. Returns whether anything changed.
    pub fn toggle_mute(&mut self) -> bool {
        match self.microphone() {
            Some(mic) => {
                mic.set_enabled(!mic.is_enabled());
                tracing::info!("Microphone {}", if mic.is_enabled() { "on" } else { "muted" });
                true
            }
            None => false,
        }
    }

    /// Flip the camera track on the wire without releasing the device.
    pub fn toggle_camera_enabled(&mut self) -> bool {
        match self.camera {
            Some(ref camera) if camera.is_live() => {
                camera.set_enabled(!camera.is_enabled());
                tracing::info!("Camera {}", if camera.is_enabled() { "on" } else { "off" });
                true
            }
            _ => false,
        }
    }

    /// Send camera video, capturing the camera if needed. Stops a screen
    /// share first.
    pub async fn enable_video(&mut self) -> Result<TrackChange, CallError> {
        let mut change = TrackChange::default();
        let was_sharing = self.screen.is_some();
        if was_sharing {
            change = self.stop_screen_share().await?;
        }
        if let Some(ref camera) = self.camera {
            if camera.is_live() {
                camera.set_enabled(true);
                return Ok(change);
            }
        }

        let camera = match self.capture_camera().await {
            Ok(camera) => camera,
            // The share is gone either way; the slot change still has to be negotiated.
            Err(e) if was_sharing => {
                tracing::warn!("Camera unavailable after screen share: {}", e);
                change.camera_lost = true;
                return Ok(change);
            }
            Err(e) => return Err(e),
        };
        change.renegotiate |= self.put_video(Some(&camera)).await?;
        change.camera_lost = false;
        self.camera = Some(camera);
        tracing::info!("Camera video enabled");
        Ok(change)
    }

    /// Stop all outgoing video, including a screen share, and release the camera.
    pub async fn disable_video(&mut self) -> Result<TrackChange, CallError> {
        let mut change = TrackChange::default();
        if let Some(share) = self.screen.take() {
            change.renegotiate |= self.release_share(share).await;
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        change.renegotiate |= self.put_video(None).await?;
        tracing::info!("Outgoing video disabled");
        Ok(change)
    }

    /// Send the screen in the video slot instead of the camera.
    pub async fn start_screen_share(&mut self) -> Result<TrackChange, CallError> {
        let mut change = TrackChange::default();
        if self.screen.is_some() {
            return Ok(change);
        }
        let call_id = self.live_call_id()?;
        let pc = self.connection()?;
        let stream = self.engine.get_display_media().await?;
        let display = stream
            .video_tracks()
            .next()
            .cloned()
            .ok_or_else(|| CallError::ScreenShareUnavailable("no display track".into()))?;

        match self.put_video(Some(&display)).await {
            Ok(recreated) => change.renegotiate |= recreated,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        }

        let camera_was_enabled = self.camera.take().map(|camera| {
            let enabled = camera.is_enabled();
            camera.stop();
            enabled
        });

        // Display audio is an extra track next to the microphone.
        let mut audio_sender = None;
        if let Some(audio) = stream.audio_tracks().next() {
            match pc.add_track(audio).await {
                Ok(sender) => {
                    audio_sender = Some(sender);
                    change.renegotiate = true;
                }
                Err(e) => tracing::warn!("Screen audio not sent: {:#}", e),
            }
        }

        let events = self.events.clone();
        let ended = display.clone();
        let watcher = tokio::spawn(async move {
            ended.ended().await;
            let _ = events.send(MediaEvent::ScreenShareEnded {
                call_id,
                track_id: ended.id().to_string(),
            });
        });

        tracing::info!(
            "Screen share started{}",
            if audio_sender.is_some() { " with audio" } else { "" }
        );
        self.screen = Some(ScreenShare {
            stream,
            audio_sender,
            watcher,
            camera_was_enabled,
        });
        Ok(change)
    }

    /// Stop sharing and restore the camera as it was before.
    pub async fn stop_screen_share(&mut self) -> Result<TrackChange, CallError> {
        let mut change = TrackChange::default();
        let share = match self.screen.take() {
            Some(share) => share,
            None => return Ok(change),
        };
        let camera_was_enabled = share.camera_was_enabled;
        change.renegotiate |= self.release_share(share).await;

        let enabled = match camera_was_enabled {
            Some(enabled) => enabled,
            None => {
                change.renegotiate |= self.put_video(None).await?;
                tracing::info!("Screen share stopped");
                return Ok(change);
            }
        };

        match self.capture_camera().await {
            Ok(camera) => {
                camera.set_enabled(enabled);
                change.renegotiate |= self.put_video(Some(&camera)).await?;
                self.camera = Some(camera);
                tracing::info!("Screen share stopped, camera restored");
            }
            Err(e) => {
                tracing::warn!("Camera reacquisition failed after screen share: {}", e);
                change.renegotiate |= self.put_video(None).await?;
                change.camera_lost = true;
            }
        }
        Ok(change)
    }

    /// Record a remote track announced by the peer connection.
    pub fn on_remote_track(&mut self, kind: MediaKind, stream_id: &str) {
        let handle = self.remote.get_or_insert_with(|| StreamHandle {
            id: stream_id.to_string(),
            audio: false,
            video: false,
        });
        match kind {
            MediaKind::Audio => handle.audio = true,
            MediaKind::Video => handle.video = true,
        }
    }

    // -----------------------------------------------------------------------
    // Projections
    // -----------------------------------------------------------------------

    pub fn has_video(&self) -> bool {
        self.screen.is_some() || self.camera.as_ref().is_some_and(|c| c.is_live())
    }

    pub fn is_muted(&self) -> bool {
        self.microphone().is_some_and(|mic| !mic.is_enabled())
    }

    pub fn is_camera_off(&self) -> bool {
        !self
            .camera
            .as_ref()
            .is_some_and(|c| c.is_live() && c.is_enabled())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Whether `track_id` is the display track of the share running now.
    pub fn is_current_share(&self, track_id: &str) -> bool {
        self.screen
            .as_ref()
            .is_some_and(|share| share.stream.video_tracks().any(|t| t.id() == track_id))
    }

    pub fn local_handle(&self) -> Option<StreamHandle> {
        self.local.as_ref().map(|stream| StreamHandle {
            id: stream.id.clone(),
            audio: stream.audio_tracks().any(|t| t.is_live()),
            video: self.has_video(),
        })
    }

    pub fn remote_handle(&self) -> Option<StreamHandle> {
        self.remote.clone()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop every track, close the connection and forget the call. Safe to
    /// call at any time, any number of times.
    pub fn teardown(&mut self) {
        if let Some(h) = self.forwarder.take() {
            h.abort();
        }
        if let Some(share) = self.screen.take() {
            share.watcher.abort();
            share.stream.stop_all();
        }
        if let Some(camera) = self.camera.take() {
            camera.stop();
        }
        if let Some(stream) = self.local.take() {
            stream.stop_all();
        }
        if let Some(pc) = self.pc.take() {
            pc.close();
        }
        if let Some(call_id) = self.call_id.take() {
            tracing::debug!("Media for call {} torn down", call_id);
        }
        self.audio_sender = None;
        self.video_sender = None;
        self.pending_candidates.clear();
        self.remote = None;
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn connection(&self) -> Result<Arc<dyn PeerConnection>, CallError> {
        self.pc
            .clone()
            .ok_or_else(|| CallError::Connection("no peer connection".into()))
    }

    fn live_call_id(&self) -> Result<String, CallError> {
        self.call_id
            .clone()
            .ok_or_else(|| CallError::Connection("no call in progress".into()))
    }

    fn microphone(&self) -> Option<&LocalTrack> {
        self.local.as_ref().and_then(|s| {
            s.audio_tracks()
                .find(|t| t.source() == TrackSource::Microphone)
        })
    }

    async fn capture_camera(&self) -> Result<LocalTrack, CallError> {
        let stream = self.engine.get_user_media(false, true).await?;
        let camera = stream.video_tracks().next().cloned();
        camera.ok_or_else(|| CallError::MediaUnavailable("no camera track".into()))
    }

    /// Put `track` in the video slot. Returns `true` when the slot had to be
    /// recreated because in-place replacement is unavailable.
    async fn put_video(&mut self, track: Option<&LocalTrack>) -> Result<bool, CallError> {
        let pc = self.connection()?;
        if let Some(sender) = self.video_sender {
            match pc.replace_track(sender, track).await {
                Ok(()) => return Ok(false),
                Err(e) => tracing::debug!("replace_track unavailable ({:#}); renegotiating", e),
            }
        }

        if let Some(sender) = self.video_sender.take() {
            if let Err(e) = pc.remove_track(sender).await {
                tracing::debug!("Removing old video slot failed: {:#}", e);
            }
        }
        let sender = match track {
            Some(t) => pc.add_track(t).await,
            None => pc.add_transceiver(MediaKind::Video).await,
        }
        .map_err(connection_error)?;
        self.video_sender = Some(sender);
        Ok(true)
    }

    /// Stop a screen share's tracks. Returns `true` if a sender was removed.
    async fn release_share(&mut self, share: ScreenShare) -> bool {
        share.watcher.abort();
        share.stream.stop_all();
        let sender = match share.audio_sender {
            Some(sender) => sender,
            None => return false,
        };
        if let Some(ref pc) = self.pc {
            if let Err(e) = pc.remove_track(sender).await {
                tracing::debug!("Removing screen audio failed: {:#}", e);
            }
        }
        true
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn connection_error(e: anyhow::Error) -> CallError {
    CallError::Connection(format!("{:#}", e))
}

fn negotiation_error(e: anyhow::Error) -> CallError {
    CallError::Negotiation(format!("{:#}", e))
}
