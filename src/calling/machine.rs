//! Call state machine.
//!
//! One actor task owns the live call. UI commands and inbound signals are
//! funneled into its mailbox, media events into a second channel, and both
//! are handled one at a time together with the duration ticker and the
//! settle / setup deadlines. Nothing else touches the media session, so a
//! negotiation step always completes before the next event is looked at.
//!
//! Call lifecycle:
//!   Idle ─start─▶ Calling ─answer rcvd─▶ Active ─end/lost─▶ Ended ─2s─▶ Idle
//!   Idle ─offer─▶ Ringing ─answer()───▶ Active
//!   Ringing ─decline()─▶ Idle

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::WatchStream;

use super::channel::SignalChannel;
use super::media::{MediaEvent, MediaSession, TrackChange};
use super::records::{CallLog, CallRecord, CallRecordUpdate, CallStatus, Recorder};
use super::rtc::{
    IceCandidateInit, MediaEngine, PeerEvent, RtcConfig, SessionDescription, SignalingState,
};
use super::signaling::Signal;
use super::snapshot::{CallNotice, CallSnapshot, EndReason};
use super::tone::{AudioSink, Ringer, DEFAULT_RING_INTERVAL};
use super::{CallDirection, CallError, CallState, CallType};
use crate::bus::SignalTransport;

const TICK: Duration = Duration::from_secs(1);
/// Finished call ids remembered to drop late offers for them.
const FINISHED_MEMORY: usize = 32;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_id: String,
    /// Conversation joined at startup and used by `start`.
    pub conversation_id: String,
    pub rtc: RtcConfig,
    pub settle_delay: Duration,
    /// `None` lets an unanswered call ring forever.
    pub setup_timeout: Option<Duration>,
    pub ring_interval: Duration,
}

impl EngineConfig {
    pub fn new(user_id: &str, conversation_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            rtc: RtcConfig::default(),
            settle_delay: Duration::from_secs(2),
            setup_timeout: Some(Duration::from_secs(45)),
            ring_interval: DEFAULT_RING_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        conversation_id: Option<String>,
        peer_id: String,
        call_type: CallType,
    },
    Answer,
    Decline,
    End,
    ToggleMute,
    ToggleCamera,
    EnableCamera,
    DisableCamera,
    ToggleScreenShare,
    /// Subscribe to another conversation's signals.
    Join(String),
    Shutdown,
}

#[derive(Debug)]
enum Event {
    Command(Command),
    Signal {
        conversation_id: String,
        signal: Signal,
    },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct CallHandle {
    inbox: mpsc::UnboundedSender<Event>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn command(&self, command: Command) -> Result<()> {
        self.inbox
            .send(Event::Command(command))
            .map_err(|_| anyhow!("call engine has stopped"))
    }

    /// Call `peer_id` in the default conversation.
    pub fn start(&self, peer_id: &str, call_type: CallType) -> Result<()> {
        self.command(Command::Start {
            conversation_id: None,
            peer_id: peer_id.to_string(),
            call_type,
        })
    }

    pub fn start_in(&self, conversation_id: &str, peer_id: &str, call_type: CallType) -> Result<()> {
        self.command(Command::Start {
            conversation_id: Some(conversation_id.to_string()),
            peer_id: peer_id.to_string(),
            call_type,
        })
    }

    pub fn answer(&self) -> Result<()> {
        self.command(Command::Answer)
    }

    pub fn decline(&self) -> Result<()> {
        self.command(Command::Decline)
    }

    pub fn end(&self) -> Result<()> {
        self.command(Command::End)
    }

    pub fn toggle_mute(&self) -> Result<()> {
        self.command(Command::ToggleMute)
    }

    pub fn toggle_camera(&self) -> Result<()> {
        self.command(Command::ToggleCamera)
    }

    pub fn enable_camera(&self) -> Result<()> {
        self.command(Command::EnableCamera)
    }

    pub fn disable_camera(&self) -> Result<()> {
        self.command(Command::DisableCamera)
    }

    pub fn toggle_screen_share(&self) -> Result<()> {
        self.command(Command::ToggleScreenShare)
    }

    pub fn join(&self, conversation_id: &str) -> Result<()> {
        self.command(Command::Join(conversation_id.to_string()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Every published snapshot, starting with the current one.
    pub fn updates(&self) -> WatchStream<CallSnapshot> {
        WatchStream::new(self.snapshot.clone())
    }
}

/// Start an engine for `config.user_id`, subscribed to its default conversation.
pub async fn spawn(
    config: EngineConfig,
    transport: Arc<dyn SignalTransport>,
    media_engine: Arc<dyn MediaEngine>,
    log: Arc<dyn CallLog>,
    sink: Arc<dyn AudioSink>,
) -> Result<(CallHandle, JoinHandle<()>)> {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());

    let mut machine = CallMachine {
        media: MediaSession::new(media_engine, config.rtc.clone(), media_tx),
        ringer: Ringer::new(sink, config.ring_interval),
        recorder: Recorder::spawn(log),
        transport,
        channels: HashMap::new(),
        inbox: inbox_tx.clone(),
        session: None,
        notice: None,
        finished: VecDeque::new(),
        settle_at: None,
        setup_deadline: None,
        restart_ticker: false,
        snapshot: snapshot_tx,
        config,
    };
    let default_conversation = machine.config.conversation_id.clone();
    machine
        .join(&default_conversation)
        .await
        .with_context(|| format!("Failed to join conversation {}", default_conversation))?;
    tracing::info!(
        "Call engine ready for {} in {}",
        machine.config.user_id,
        default_conversation
    );

    let task = tokio::spawn(machine.run(inbox_rx, media_rx));
    Ok((
        CallHandle {
            inbox: inbox_tx,
            snapshot: snapshot_rx,
        },
        task,
    ))
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct CallSession {
    call_id: String,
    conversation_id: String,
    call_type: CallType,
    direction: CallDirection,
    caller_id: String,
    callee_id: String,
    peer_id: String,
    state: CallState,
    started_at: Option<chrono::DateTime<Utc>>,
    duration_seconds: u64,
    end_reason: Option<EndReason>,
    /// A local renegotiation is waiting for the signaling state to settle.
    renegotiation_pending: bool,
}

struct CallMachine {
    config: EngineConfig,
    transport: Arc<dyn SignalTransport>,
    channels: HashMap<String, SignalChannel>,
    inbox: mpsc::UnboundedSender<Event>,
    media: MediaSession,
    ringer: Ringer,
    recorder: Recorder,
    session: Option<CallSession>,
    notice: Option<CallNotice>,
    finished: VecDeque<String>,
    settle_at: Option<Instant>,
    setup_deadline: Option<Instant>,
    restart_ticker: bool,
    snapshot: watch::Sender<CallSnapshot>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl CallMachine {
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Event>,
        mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        let mut ticker = time::interval_at(Instant::now() + TICK, TICK);
        self.publish();

        loop {
            let ticking = self.state() == CallState::Active;
            let settle_at = self.settle_at;
            let setup_deadline = self.setup_deadline;

            tokio::select! {
                event = inbox.recv() => match event {
                    Some(Event::Command(Command::Shutdown)) | None => break,
                    Some(Event::Command(command)) => self.on_command(command).await,
                    Some(Event::Signal { conversation_id, signal }) => {
                        self.on_signal(&conversation_id, signal).await
                    }
                },
                Some(event) = media_events.recv() => self.on_media_event(event).await,
                _ = ticker.tick(), if ticking => {
                    if let Some(ref mut session) = self.session {
                        session.duration_seconds += 1;
                    }
                }
                _ = sleep_until(settle_at) => self.on_settled(),
                _ = sleep_until(setup_deadline) => self.on_setup_timeout().await,
            }

            if std::mem::take(&mut self.restart_ticker) {
                ticker.reset();
            }
            self.publish();
        }

        if self.state() != CallState::Idle && self.state() != CallState::Ended {
            if let Some(signal) = self.session.as_ref().map(|s| Signal::CallEnd {
                call_id: s.call_id.clone(),
            }) {
                self.send_for_session(signal).await;
            }
        }
        self.ringer.stop();
        self.media.teardown();
        tracing::info!("Call engine stopped");
    }

    fn state(&self) -> CallState {
        self.session.as_ref().map_or(CallState::Idle, |s| s.state)
    }

    fn live_call_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.call_id.as_str())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        tracing::debug!("Command {:?} in {}", command, self.state());
        match command {
            Command::Start {
                conversation_id,
                peer_id,
                call_type,
            } => {
                let conversation_id =
                    conversation_id.unwrap_or_else(|| self.config.conversation_id.clone());
                self.start_call(conversation_id, peer_id, call_type).await;
            }
            Command::Answer => self.answer_call().await,
            Command::Decline => self.decline_call().await,
            Command::End => self.end_call().await,
            Command::Join(conversation_id) => {
                if let Err(e) = self.join(&conversation_id).await {
                    tracing::warn!("Failed to join {}: {:#}", conversation_id, e);
                }
            }
            Command::Shutdown => {}
            toggle => {
                if self.state() != CallState::Active {
                    tracing::debug!("Ignoring {:?} outside an active call", toggle);
                    return;
                }
                self.on_media_command(toggle).await;
            }
        }
    }

    async fn start_call(&mut self, conversation_id: String, peer_id: String, call_type: CallType) {
        match self.state() {
            CallState::Idle => {}
            CallState::Ended => self.on_settled(),
            state => {
                tracing::warn!("Cannot start a call while {}", state);
                return;
            }
        }
        if let Err(e) = self.join(&conversation_id).await {
            self.notice = Some(CallNotice::SetupFailed(format!("{:#}", e)));
            return;
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("Calling {} ({}) call={}", peer_id, call_type, call_id);
        self.notice = None;
        self.session = Some(CallSession {
            call_id: call_id.clone(),
            conversation_id: conversation_id.clone(),
            call_type,
            direction: CallDirection::Outgoing,
            caller_id: self.config.user_id.clone(),
            callee_id: peer_id.clone(),
            peer_id: peer_id.clone(),
            state: CallState::Calling,
            started_at: None,
            duration_seconds: 0,
            end_reason: None,
            renegotiation_pending: false,
        });
        self.publish();

        let offer = match self.prepare_offer(&call_id, call_type).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_setup(e);
                return;
            }
        };
        self.send_for_session(Signal::Offer {
            sdp: offer,
            call_id: call_id.clone(),
            caller_id: self.config.user_id.clone(),
            callee_id: peer_id.clone(),
            call_type,
        })
        .await;
        self.recorder.insert(CallRecord {
            id: call_id,
            conversation_id,
            caller_id: self.config.user_id.clone(),
            callee_id: peer_id,
            call_type,
            status: CallStatus::Ringing,
        });
        self.ringer.start();
        self.arm_setup_timeout();
    }

    async fn prepare_offer(
        &mut self,
        call_id: &str,
        call_type: CallType,
    ) -> Result<SessionDescription, CallError> {
        self.media.acquire_local_media(call_type).await?;
        self.media.create_connection(call_id).await?;
        self.media.create_offer().await
    }

    async fn answer_call(&mut self) {
        let call_id = match self.session {
            Some(ref s) if s.state == CallState::Ringing => s.call_id.clone(),
            _ => {
                tracing::debug!("Nothing to answer");
                return;
            }
        };
        self.ringer.stop();
        match self.media.negotiate().await {
            Ok(answer) => {
                self.send_for_session(Signal::Answer {
                    sdp: answer,
                    call_id: call_id.clone(),
                })
                .await;
                self.recorder.update(&call_id, CallRecordUpdate::answered());
                self.enter_active();
            }
            Err(e) => {
                self.send_for_session(Signal::CallDecline { call_id }).await;
                self.fail_setup(e);
            }
        }
    }

    async fn decline_call(&mut self) {
        let call_id = match self.session {
            Some(ref s) if s.state == CallState::Ringing => s.call_id.clone(),
            _ => {
                tracing::debug!("Nothing to decline");
                return;
            }
        };
        tracing::info!("Declining call {}", call_id);
        self.ringer.stop();
        self.send_for_session(Signal::CallDecline {
            call_id: call_id.clone(),
        })
        .await;
        self.media.teardown();
        self.recorder
            .update(&call_id, CallRecordUpdate::finished(CallStatus::Declined));
        self.remember_finished(&call_id);
        self.setup_deadline = None;
        self.session = None;
    }

    async fn end_call(&mut self) {
        let call_id = match self.session {
            Some(ref s) if s.state != CallState::Ended => s.call_id.clone(),
            _ => {
                tracing::debug!("No call to end");
                return;
            }
        };
        tracing::info!("Ending call {}", call_id);
        self.send_for_session(Signal::CallEnd {
            call_id: call_id.clone(),
        })
        .await;
        self.recorder
            .update(&call_id, CallRecordUpdate::finished(CallStatus::Ended));
        self.enter_ended(EndReason::Local);
    }

    async fn on_media_command(&mut self, command: Command) {
        let result = match command {
            Command::ToggleMute => {
                self.media.toggle_mute();
                Ok(TrackChange::default())
            }
            Command::ToggleCamera => {
                if !self.media.is_screen_sharing() && self.media.toggle_camera_enabled() {
                    Ok(TrackChange::default())
                } else {
                    self.media.enable_video().await
                }
            }
            Command::EnableCamera => self.media.enable_video().await,
            Command::DisableCamera => self.media.disable_video().await,
            Command::ToggleScreenShare => {
                if self.media.is_screen_sharing() {
                    self.media.stop_screen_share().await
                } else {
                    self.media.start_screen_share().await
                }
            }
            _ => return,
        };
        match result {
            Ok(change) => self.apply_track_change(change).await,
            Err(CallError::ScreenShareUnavailable(reason)) => {
                tracing::warn!("Screen share unavailable: {}", reason);
                self.notice = Some(CallNotice::ScreenShareUnavailable(reason));
            }
            Err(CallError::MediaUnavailable(reason)) => {
                tracing::warn!("Camera unavailable: {}", reason);
                self.notice = Some(CallNotice::CameraUnavailable(reason));
            }
            Err(e) => tracing::warn!("Media change failed: {}", e),
        }
    }

    async fn apply_track_change(&mut self, change: TrackChange) {
        if change.camera_lost {
            self.notice = Some(CallNotice::CameraUnavailable(
                "camera could not be reacquired".into(),
            ));
        }
        if change.renegotiate {
            if let Some(ref mut session) = self.session {
                session.renegotiation_pending = true;
            }
            self.renegotiate().await;
        }
    }

    /// Send a fresh offer for the live call once the signaling state allows.
    async fn renegotiate(&mut self) {
        let (call_id, caller_id, callee_id, call_type) = match self.session {
            Some(ref s) if s.state == CallState::Active && s.renegotiation_pending => (
                s.call_id.clone(),
                s.caller_id.clone(),
                s.callee_id.clone(),
                s.call_type,
            ),
            _ => return,
        };
        if self.media.signaling_state() != Some(SignalingState::Stable) {
            tracing::debug!("Renegotiation deferred until signaling is stable");
            return;
        }
        if let Some(ref mut session) = self.session {
            session.renegotiation_pending = false;
        }
        match self.media.negotiate().await {
            Ok(offer) => {
                tracing::info!("Renegotiating call {}", call_id);
                self.send_for_session(Signal::Offer {
                    sdp: offer,
                    call_id,
                    caller_id,
                    callee_id,
                    call_type,
                })
                .await;
            }
            Err(e) => tracing::warn!("Renegotiation offer failed: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    async fn on_signal(&mut self, conversation_id: &str, signal: Signal) {
        let matches_live = self.live_call_id() == Some(signal.call_id());
        match signal {
            Signal::Offer {
                sdp,
                call_id,
                caller_id,
                callee_id,
                call_type,
            } => {
                if matches_live {
                    self.on_renegotiation_offer(sdp).await;
                    return;
                }
                if callee_id != self.config.user_id {
                    tracing::debug!("Offer {} is for {}, not us", call_id, callee_id);
                    return;
                }
                if self.finished.contains(&call_id) {
                    tracing::debug!("Late offer for finished call {}", call_id);
                    return;
                }
                self.on_incoming_offer(conversation_id, sdp, call_id, caller_id, call_type)
                    .await;
            }
            _ if !matches_live => {
                tracing::debug!(
                    "Ignoring {} for call {} (not the live call)",
                    signal.kind(),
                    signal.call_id()
                );
            }
            Signal::Answer { sdp, .. } => self.on_answer(sdp).await,
            Signal::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate).await,
            Signal::CallEnd { .. } => self.on_remote_hangup(EndReason::Remote),
            Signal::CallDecline { .. } => self.on_remote_hangup(EndReason::Declined),
        }
    }

    async fn on_incoming_offer(
        &mut self,
        conversation_id: &str,
        sdp: SessionDescription,
        call_id: String,
        caller_id: String,
        call_type: CallType,
    ) {
        let glare_lost = match self.session {
            Some(ref s) if s.state == CallState::Calling && s.peer_id == caller_id => {
                // Both sides dialed each other: the smaller user id's call wins.
                self.config.user_id > caller_id
            }
            _ => false,
        };
        if glare_lost {
            self.abandon_outgoing_call();
        }

        if self.session.is_some() {
            tracing::info!("Busy: declining call {} from {}", call_id, caller_id);
            self.send_to(conversation_id, &Signal::CallDecline { call_id })
                .await;
            return;
        }

        tracing::info!("Incoming {} call {} from {}", call_type, call_id, caller_id);
        self.notice = None;
        self.session = Some(CallSession {
            call_id: call_id.clone(),
            conversation_id: conversation_id.to_string(),
            call_type,
            direction: CallDirection::Incoming,
            caller_id: caller_id.clone(),
            callee_id: self.config.user_id.clone(),
            peer_id: caller_id,
            state: CallState::Ringing,
            started_at: None,
            duration_seconds: 0,
            end_reason: None,
            renegotiation_pending: false,
        });
        self.publish();

        match self.prepare_incoming(&call_id, call_type, sdp).await {
            Ok(()) => {
                self.ringer.start();
                self.arm_setup_timeout();
            }
            Err(e) => {
                self.send_for_session(Signal::CallDecline { call_id }).await;
                self.fail_setup(e);
            }
        }
    }

    async fn prepare_incoming(
        &mut self,
        call_id: &str,
        call_type: CallType,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        self.media.acquire_local_media(call_type).await?;
        self.media.create_connection(call_id).await?;
        self.media.set_remote_description(offer).await
    }

    /// Drop our own dialing attempt after losing a simultaneous-call race.
    fn abandon_outgoing_call(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!(
                "Simultaneous call with {}: yielding, dropping call {}",
                session.peer_id,
                session.call_id
            );
            self.ringer.stop();
            self.media.teardown();
            self.recorder.update(
                &session.call_id,
                CallRecordUpdate::finished(CallStatus::Ended),
            );
            self.remember_finished(&session.call_id);
            self.setup_deadline = None;
        }
    }

    async fn on_renegotiation_offer(&mut self, sdp: SessionDescription) {
        let (call_id, direction) = match self.session {
            Some(ref s) if s.state == CallState::Active => (s.call_id.clone(), s.direction),
            _ => {
                tracing::debug!("Duplicate offer for the live call ignored");
                return;
            }
        };
        if self.media.awaiting_answer() {
            if direction == CallDirection::Outgoing {
                tracing::debug!("Renegotiation collision: keeping our offer");
                return;
            }
            // Callee yields; our rolled-back change is offered again afterwards.
            tracing::debug!("Renegotiation collision: yielding to the caller");
            if let Some(ref mut session) = self.session {
                session.renegotiation_pending = true;
            }
        }

        if let Err(e) = self.media.set_remote_description(sdp).await {
            tracing::warn!("Renegotiation offer rejected: {}", e);
            return;
        }
        match self.media.negotiate().await {
            Ok(answer) => {
                self.send_for_session(Signal::Answer {
                    sdp: answer,
                    call_id,
                })
                .await;
            }
            Err(e) => {
                tracing::warn!("Renegotiation answer failed: {}", e);
                return;
            }
        }
        self.renegotiate().await;
    }

    async fn on_answer(&mut self, sdp: SessionDescription) {
        let state = self.state();
        if !matches!(state, CallState::Calling | CallState::Active) {
            tracing::debug!("Answer ignored in {}", state);
            return;
        }
        if !self.media.awaiting_answer() {
            tracing::debug!("Answer ignored: no offer outstanding");
            return;
        }

        if state == CallState::Calling {
            self.ringer.stop();
        }
        if let Err(e) = self.media.set_remote_description(sdp).await {
            tracing::warn!("Failed to apply answer: {}", e);
            if let Some(call_id) = self.live_call_id().map(str::to_string) {
                self.send_for_session(Signal::CallEnd {
                    call_id: call_id.clone(),
                })
                .await;
                self.recorder
                    .update(&call_id, CallRecordUpdate::finished(CallStatus::Ended));
            }
            self.enter_ended(EndReason::Failed);
            return;
        }

        if state == CallState::Calling {
            self.enter_active();
        } else {
            self.renegotiate().await;
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if self.state() == CallState::Ended {
            return;
        }
        self.media.add_remote_candidate(candidate).await;
    }

    fn on_remote_hangup(&mut self, reason: EndReason) {
        if self.state() == CallState::Ended {
            tracing::debug!("Duplicate hangup ignored");
            return;
        }
        tracing::info!(
            "Call {} ended by peer ({:?})",
            self.live_call_id().unwrap_or_default(),
            reason
        );
        self.enter_ended(reason);
    }

    // -----------------------------------------------------------------------
    // Media events
    // -----------------------------------------------------------------------

    async fn on_media_event(&mut self, event: MediaEvent) {
        let call_id = match &event {
            MediaEvent::Peer { call_id, .. } | MediaEvent::ScreenShareEnded { call_id, .. } => {
                call_id.clone()
            }
        };
        if self.live_call_id() != Some(call_id.as_str()) || self.state() == CallState::Ended {
            tracing::debug!("Stale media event for call {}", call_id);
            return;
        }

        let event = match event {
            MediaEvent::Peer { event, .. } => event,
            MediaEvent::ScreenShareEnded { track_id, .. } => {
                if self.state() == CallState::Active && self.media.is_current_share(&track_id) {
                    tracing::info!("Screen share ended outside the app");
                    self.on_media_command(Command::ToggleScreenShare).await;
                } else {
                    tracing::debug!("End of an earlier screen share ignored");
                }
                return;
            }
        };

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_for_session(Signal::IceCandidate { candidate, call_id })
                    .await;
            }
            PeerEvent::RemoteTrack {
                kind, stream_id, ..
            } => {
                tracing::debug!("Remote {} track on stream {}", kind.as_str(), stream_id);
                self.media.on_remote_track(kind, &stream_id);
            }
            PeerEvent::ConnectionState(state) if state.is_lost() => {
                tracing::warn!("Connection {:?}; ending call {}", state, call_id);
                self.send_for_session(Signal::CallEnd {
                    call_id: call_id.clone(),
                })
                .await;
                self.recorder
                    .update(&call_id, CallRecordUpdate::finished(CallStatus::Ended));
                self.enter_ended(EndReason::ConnectionLost);
            }
            PeerEvent::ConnectionState(state) => {
                tracing::debug!("Connection state {:?}", state);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn enter_active(&mut self) {
        self.setup_deadline = None;
        self.restart_ticker = true;
        if let Some(ref mut session) = self.session {
            session.state = CallState::Active;
            session.started_at = Some(Utc::now());
            session.duration_seconds = 0;
            tracing::info!("Call {} active with {}", session.call_id, session.peer_id);
        }
    }

    /// Release everything now; the session stays visible until the settle delay.
    fn enter_ended(&mut self, reason: EndReason) {
        self.ringer.stop();
        self.media.teardown();
        self.setup_deadline = None;
        self.settle_at = Some(Instant::now() + self.config.settle_delay);
        if let Some(ref mut session) = self.session {
            session.state = CallState::Ended;
            session.end_reason = Some(reason);
            session.renegotiation_pending = false;
        }
        if let Some(call_id) = self.live_call_id().map(str::to_string) {
            self.remember_finished(&call_id);
        }
    }

    fn on_settled(&mut self) {
        self.settle_at = None;
        if self.session.take().is_some() {
            tracing::debug!("Call settled; idle");
        }
    }

    fn fail_setup(&mut self, error: CallError) {
        tracing::warn!("Call setup failed: {}", error);
        self.ringer.stop();
        self.media.teardown();
        if let Some(session) = self.session.take() {
            self.remember_finished(&session.call_id);
        }
        self.setup_deadline = None;
        self.notice = Some(CallNotice::SetupFailed(error.to_string()));
    }

    fn arm_setup_timeout(&mut self) {
        self.setup_deadline = self.config.setup_timeout.map(|t| Instant::now() + t);
    }

    async fn on_setup_timeout(&mut self) {
        self.setup_deadline = None;
        let (call_id, state) = match self.session {
            Some(ref s) => (s.call_id.clone(), s.state),
            None => return,
        };
        let signal = match state {
            CallState::Calling => Signal::CallEnd {
                call_id: call_id.clone(),
            },
            CallState::Ringing => Signal::CallDecline {
                call_id: call_id.clone(),
            },
            _ => return,
        };
        tracing::info!("Call {} unanswered; giving up", call_id);
        self.send_for_session(signal).await;
        self.recorder
            .update(&call_id, CallRecordUpdate::finished(CallStatus::Missed));
        self.notice = Some(CallNotice::Unanswered);
        self.enter_ended(EndReason::Unanswered);
    }

    fn remember_finished(&mut self, call_id: &str) {
        if self.finished.iter().any(|id| id == call_id) {
            return;
        }
        if self.finished.len() == FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(call_id.to_string());
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn join(&mut self, conversation_id: &str) -> Result<()> {
        if self.channels.contains_key(conversation_id) {
            return Ok(());
        }
        let mut channel = SignalChannel::new(self.transport.clone(), conversation_id);
        let inbox = self.inbox.clone();
        let tag = conversation_id.to_string();
        channel
            .on_signal(move |signal| {
                let _ = inbox.send(Event::Signal {
                    conversation_id: tag.clone(),
                    signal,
                });
            })
            .await?;
        self.channels.insert(conversation_id.to_string(), channel);
        Ok(())
    }

    async fn send_to(&self, conversation_id: &str, signal: &Signal) {
        match self.channels.get(conversation_id) {
            Some(channel) => channel.send(signal).await,
            None => tracing::warn!(
                "Not joined to {}; {} dropped",
                conversation_id,
                signal.kind()
            ),
        }
    }

    async fn send_for_session(&self, signal: Signal) {
        if let Some(ref session) = self.session {
            self.send_to(&session.conversation_id, &signal).await;
        }
    }

    fn publish(&self) {
        let next = self.build_snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.state != next.state {
                tracing::debug!("State {} -> {}", current.state, next.state);
            }
            *current = next;
            true
        });
    }

    fn build_snapshot(&self) -> CallSnapshot {
        let remote_stream = self.media.remote_handle();
        let mut snap = CallSnapshot {
            has_video: self.media.has_video(),
            is_muted: self.media.is_muted(),
            is_camera_off: self.media.is_camera_off(),
            is_screen_sharing: self.media.is_screen_sharing(),
            local_stream: self.media.local_handle(),
            remote_has_video: remote_stream.as_ref().is_some_and(|r| r.video),
            remote_stream,
            notice: self.notice.clone(),
            ..CallSnapshot::default()
        };
        if let Some(ref s) = self.session {
            snap.state = s.state;
            snap.call_id = Some(s.call_id.clone());
            snap.conversation_id = Some(s.conversation_id.clone());
            snap.call_type = Some(s.call_type);
            snap.peer_id = Some(s.peer_id.clone());
            snap.direction = Some(s.direction);
            snap.duration_seconds = s.duration_seconds;
            snap.started_at = s.started_at;
            snap.end_reason = s.end_reason;
        }
        snap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryHub;
    use crate::calling::records::{LogEntry, MemoryCallLog};
    use crate::calling::rtc::{MediaKind, PeerConnection};
    use crate::calling::sim::{SimEngine, SimOptions};
    use crate::calling::tone::NullSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CONV: &str = "conv-1";

    #[derive(Default)]
    struct CountingSink {
        frames: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn play(&self, _frame: Vec<i16>) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Party {
        handle: CallHandle,
        engine: Arc<SimEngine>,
        log: Arc<MemoryCallLog>,
        sink: Arc<CountingSink>,
    }

    async fn party(hub: &MemoryHub, user: &str) -> Party {
        party_with(hub, EngineConfig::new(user, CONV), SimOptions::default()).await
    }

    async fn party_with(hub: &MemoryHub, config: EngineConfig, options: SimOptions) -> Party {
        let engine = Arc::new(SimEngine::with_options(options));
        let log = Arc::new(MemoryCallLog::default());
        let sink = Arc::new(CountingSink::default());
        let (handle, _task) = spawn(
            config,
            Arc::new(hub.client()),
            engine.clone(),
            log.clone(),
            sink.clone(),
        )
        .await
        .unwrap();
        Party {
            handle,
            engine,
            log,
            sink,
        }
    }

    /// Raw channel member for injecting and observing signals.
    async fn observer(hub: &MemoryHub) -> (SignalChannel, mpsc::UnboundedReceiver<Signal>) {
        let mut channel = SignalChannel::new(Arc::new(hub.client()), CONV);
        let (tx, rx) = mpsc::unbounded_channel();
        channel
            .on_signal(move |s| {
                let _ = tx.send(s);
            })
            .await
            .unwrap();
        (channel, rx)
    }

    async fn wait_for(
        handle: &CallHandle,
        what: &str,
        pred: impl FnMut(&CallSnapshot) -> bool,
    ) -> CallSnapshot {
        let mut rx = handle.watch();
        let snap = match time::timeout(Duration::from_secs(120), rx.wait_for(pred)).await {
            Ok(Ok(snap)) => snap.clone(),
            _ => panic!("timed out waiting for {}: {:?}", what, handle.snapshot()),
        };
        snap
    }

    async fn wait_state(handle: &CallHandle, state: CallState) -> CallSnapshot {
        wait_for(handle, state.as_str(), |s| s.state == state).await
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn next_offer(rx: &mut mpsc::UnboundedReceiver<Signal>) -> (String, SessionDescription) {
        loop {
            if let Some(Signal::Offer { call_id, sdp, .. }) = rx.recv().await {
                return (call_id, sdp);
            }
        }
    }

    /// Bring alice and bob into an active call started by alice.
    async fn active_call(hub: &MemoryHub, call_type: CallType) -> (Party, Party, String) {
        let alice = party(hub, "alice").await;
        let bob = party(hub, "bob").await;
        alice.handle.start("bob", call_type).unwrap();
        let ringing = wait_state(&bob.handle, CallState::Ringing).await;
        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
        wait_state(&bob.handle, CallState::Active).await;
        (alice, bob, ringing.call_id.unwrap_or_default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_happy_path() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.handle.start("bob", CallType::Video).unwrap();
        let calling = wait_state(&alice.handle, CallState::Calling).await;
        assert_eq!(calling.status_text(), "Calling...");
        let ringing = wait_state(&bob.handle, CallState::Ringing).await;
        assert_eq!(ringing.peer_id.as_deref(), Some("alice"));
        assert_eq!(ringing.call_type, Some(CallType::Video));
        assert_eq!(ringing.direction, Some(CallDirection::Incoming));
        let call_id = ringing.call_id.clone().unwrap();
        assert_eq!(
            wait_for(&alice.handle, "call id", |s| s.call_id.is_some()).await.call_id,
            Some(call_id.clone())
        );

        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
        wait_state(&bob.handle, CallState::Active).await;

        let rung = alice.sink.frames.load(Ordering::SeqCst) + bob.sink.frames.load(Ordering::SeqCst);
        assert!(rung > 0);
        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(
            alice.sink.frames.load(Ordering::SeqCst) + bob.sink.frames.load(Ordering::SeqCst),
            rung
        );

        for p in [&alice, &bob] {
            let snap = p.handle.snapshot();
            assert_eq!(snap.duration_seconds, 3);
            assert_eq!(snap.status_text(), "00:03");
            assert!(snap.has_video);
            assert!(!snap.is_camera_off);
            assert!(snap.started_at.is_some());
            assert_eq!(snap.call_id.as_deref(), Some(call_id.as_str()));
        }
        let bob_snap = wait_for(&bob.handle, "remote video", |s| s.remote_has_video).await;
        assert!(bob_snap.remote_stream.unwrap().audio);

        settle().await;
        let alice_log = alice.log.entries();
        assert!(matches!(
            alice_log[0],
            LogEntry::Insert(ref r) if r.id == call_id && r.status == CallStatus::Ringing
        ));
        assert!(bob.log.entries().iter().any(|e| matches!(
            e,
            LogEntry::Update(id, u) if *id == call_id && u.status == Some(CallStatus::Active)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_callee_declines_second_call() {
        let hub = MemoryHub::new();
        let (carol, bob, first_call) = {
            let carol = party(&hub, "carol").await;
            let bob = party(&hub, "bob").await;
            carol.handle.start("bob", CallType::Audio).unwrap();
            let ringing = wait_state(&bob.handle, CallState::Ringing).await;
            bob.handle.answer().unwrap();
            wait_state(&carol.handle, CallState::Active).await;
            (carol, bob, ringing.call_id.unwrap())
        };
        let alice = party(&hub, "alice").await;

        alice.handle.start("bob", CallType::Video).unwrap();
        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Declined));
        wait_state(&alice.handle, CallState::Idle).await;

        for p in [&bob, &carol] {
            let snap = p.handle.snapshot();
            assert_eq!(snap.state, CallState::Active);
            assert_eq!(snap.call_id.as_deref(), Some(first_call.as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_for_other_calls_are_ignored() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let (peer, mut inbound) = observer(&hub).await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        let (call_id, _) = next_offer(&mut inbound).await;
        let before = wait_state(&alice.handle, CallState::Calling).await;

        let stranger = "not-this-call".to_string();
        let candidate = crate::calling::ice::Candidate::new(
            crate::calling::ice::CandidateType::Host,
            "10.9.9.9",
            7000,
        )
        .to_init("0", 0);
        for signal in [
            Signal::Answer {
                sdp: SessionDescription::answer("v=0\r\n"),
                call_id: stranger.clone(),
            },
            Signal::IceCandidate {
                candidate,
                call_id: stranger.clone(),
            },
            Signal::CallEnd {
                call_id: stranger.clone(),
            },
            Signal::CallDecline { call_id: stranger },
        ] {
            peer.send(&signal).await;
        }
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(alice.handle.snapshot(), before);
        assert!(alice
            .engine
            .last_connection()
            .unwrap()
            .applied_candidates()
            .is_empty());

        peer.send(&Signal::CallDecline { call_id }).await;
        wait_state(&alice.handle, CallState::Ended).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_replayed_once_in_order() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let (peer, mut inbound) = observer(&hub).await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        let (call_id, offer) = next_offer(&mut inbound).await;

        // Produce a real answer from a second simulated stack.
        let remote_engine = SimEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = remote_engine
            .create_peer_connection(&RtcConfig::default(), tx)
            .await
            .unwrap();
        remote.set_remote_description(offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        remote.set_local_description(answer.clone()).await.unwrap();

        let candidate = |port: u16| {
            crate::calling::ice::Candidate::new(
                crate::calling::ice::CandidateType::Host,
                "10.1.1.1",
                port,
            )
            .to_init("0", 0)
        };
        for port in [7001, 7002, 7003] {
            peer.send(&Signal::IceCandidate {
                candidate: candidate(port),
                call_id: call_id.clone(),
            })
            .await;
        }
        peer.send(&Signal::Answer {
            sdp: answer,
            call_id: call_id.clone(),
        })
        .await;
        wait_state(&alice.handle, CallState::Active).await;
        peer.send(&Signal::IceCandidate {
            candidate: candidate(7004),
            call_id,
        })
        .await;
        time::sleep(Duration::from_millis(50)).await;

        let applied: Vec<String> = alice
            .engine
            .last_connection()
            .unwrap()
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied.len(), 4);
        for (line, port) in applied.iter().zip([7001, 7002, 7003, 7004]) {
            assert!(line.contains(&format!(" {} typ", port)), "{}", line);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_releases_media_then_settles() {
        let hub = MemoryHub::new();
        let (alice, bob, call_id) = active_call(&hub, CallType::Video).await;

        alice.handle.end().unwrap();
        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Local));
        assert_eq!(ended.status_text(), "Call ended");
        assert!(!ended.has_video);
        assert!(alice.engine.live_tracks().is_empty());
        assert!(alice.engine.captured_tracks().iter().all(|t| !t.is_enabled()));
        assert!(alice.engine.last_connection().unwrap().is_closed());

        let bob_ended = wait_state(&bob.handle, CallState::Ended).await;
        assert_eq!(bob_ended.end_reason, Some(EndReason::Remote));
        assert!(bob.engine.live_tracks().is_empty());

        time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(alice.handle.snapshot().state, CallState::Ended);
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(alice.handle.snapshot().state, CallState::Idle);
        wait_state(&bob.handle, CallState::Idle).await;

        settle().await;
        assert!(alice.log.entries().iter().any(|e| matches!(
            e,
            LogEntry::Update(id, u) if *id == call_id && u.status == Some(CallStatus::Ended)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_hangup_is_noop() {
        let hub = MemoryHub::new();
        let (alice, bob, call_id) = active_call(&hub, CallType::Audio).await;
        let (peer, mut inbound) = observer(&hub).await;

        alice.handle.end().unwrap();
        wait_state(&bob.handle, CallState::Ended).await;
        alice.handle.end().unwrap();
        peer.send(&Signal::CallEnd {
            call_id: call_id.clone(),
        })
        .await;
        time::sleep(Duration::from_millis(100)).await;

        let mut ends = 0;
        while let Ok(signal) = inbound.try_recv() {
            if matches!(signal, Signal::CallEnd { .. }) {
                ends += 1;
            }
        }
        assert_eq!(ends, 1);
        assert_eq!(bob.handle.snapshot().end_reason, Some(EndReason::Remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_returns_callee_to_idle() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        let ringing = wait_state(&bob.handle, CallState::Ringing).await;
        bob.handle.decline().unwrap();
        wait_state(&bob.handle, CallState::Idle).await;
        assert!(bob.engine.live_tracks().is_empty());

        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Declined));
        wait_state(&alice.handle, CallState::Idle).await;

        settle().await;
        let call_id = ringing.call_id.unwrap();
        assert!(bob.log.entries().iter().any(|e| matches!(
            e,
            LogEntry::Update(id, u) if *id == call_id && u.status == Some(CallStatus::Declined)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_ends_call() {
        let hub = MemoryHub::new();
        let (alice, bob, _) = active_call(&hub, CallType::Audio).await;

        alice.engine.fail_connection();
        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::ConnectionLost));
        assert_eq!(ended.status_text(), "Connection lost");
        let bob_ended = wait_state(&bob.handle, CallState::Ended).await;
        assert_eq!(bob_ended.end_reason, Some(EndReason::Remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_toggles_only_in_active_call() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let idle = alice.handle.snapshot();
        alice.handle.toggle_mute().unwrap();
        alice.handle.toggle_screen_share().unwrap();
        settle().await;
        assert_eq!(alice.handle.snapshot(), idle);

        alice.handle.start("bob", CallType::Audio).unwrap();
        wait_state(&alice.handle, CallState::Calling).await;
        alice.handle.toggle_mute().unwrap();
        alice.handle.enable_camera().unwrap();
        settle().await;
        let calling = alice.handle.snapshot();
        assert!(!calling.is_muted);
        assert!(!calling.has_video);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_and_camera_toggle() {
        let hub = MemoryHub::new();
        let (alice, _bob, _) = active_call(&hub, CallType::Video).await;

        alice.handle.toggle_mute().unwrap();
        wait_for(&alice.handle, "muted", |s| s.is_muted).await;
        alice.handle.toggle_camera().unwrap();
        let off = wait_for(&alice.handle, "camera off", |s| s.is_camera_off).await;
        assert!(off.has_video);
        alice.handle.toggle_camera().unwrap();
        wait_for(&alice.handle, "camera on", |s| !s.is_camera_off).await;
        assert_eq!(alice.engine.last_connection().unwrap().offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_toggle_restores_camera() {
        let hub = MemoryHub::new();
        let (alice, _bob, _) = active_call(&hub, CallType::Video).await;
        let before = alice.handle.snapshot();

        alice.handle.toggle_screen_share().unwrap();
        let sharing = wait_for(&alice.handle, "sharing", |s| s.is_screen_sharing).await;
        assert!(sharing.has_video);
        assert!(sharing.is_camera_off);

        alice.handle.toggle_screen_share().unwrap();
        let after = wait_for(&alice.handle, "not sharing", |s| !s.is_screen_sharing).await;
        assert_eq!(
            (after.has_video, after.is_camera_off),
            (before.has_video, before.is_camera_off)
        );
        assert_eq!(after.notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_stop_without_camera_drops_video() {
        let hub = MemoryHub::new();
        let (alice, bob, _) = active_call(&hub, CallType::Video).await;

        alice.handle.toggle_screen_share().unwrap();
        wait_for(&alice.handle, "sharing", |s| s.is_screen_sharing).await;
        alice.engine.update_options(|o| o.deny_camera = true);
        alice.handle.toggle_screen_share().unwrap();

        let after = wait_for(&alice.handle, "not sharing", |s| !s.is_screen_sharing).await;
        assert!(!after.has_video);
        assert!(after.is_camera_off);
        assert!(matches!(after.notice, Some(CallNotice::CameraUnavailable(_))));
        assert_eq!(after.state, CallState::Active);
        assert_eq!(bob.handle.snapshot().state, CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_ended_externally() {
        let hub = MemoryHub::new();
        let (alice, _bob, _) = active_call(&hub, CallType::Audio).await;

        alice.handle.toggle_screen_share().unwrap();
        wait_for(&alice.handle, "sharing", |s| s.is_screen_sharing).await;
        assert!(alice.engine.end_display_capture());
        let after = wait_for(&alice.handle, "share stopped", |s| !s.is_screen_sharing).await;
        assert!(!after.has_video);
        assert_eq!(after.state, CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_share_refused_keeps_call() {
        let hub = MemoryHub::new();
        let (alice, _bob, _) = active_call(&hub, CallType::Audio).await;
        alice.engine.update_options(|o| o.deny_display = true);

        alice.handle.toggle_screen_share().unwrap();
        let snap = wait_for(&alice.handle, "notice", |s| s.notice.is_some()).await;
        assert!(matches!(snap.notice, Some(CallNotice::ScreenShareUnavailable(_))));
        assert!(!snap.is_screen_sharing);
        assert_eq!(snap.state, CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_camera_on_audio_call_without_renegotiation() {
        let hub = MemoryHub::new();
        let (alice, _bob, _) = active_call(&hub, CallType::Audio).await;

        alice.handle.enable_camera().unwrap();
        let snap = wait_for(&alice.handle, "video", |s| s.has_video).await;
        assert_eq!(snap.call_type, Some(CallType::Audio));
        assert!(!snap.is_camera_off);
        let pc = alice.engine.last_connection().unwrap();
        assert_eq!(pc.offers_created(), 1);
        assert!(pc
            .sending()
            .contains(&(MediaKind::Video, Some(crate::calling::rtc::TrackSource::Camera))));

        alice.handle.disable_camera().unwrap();
        wait_for(&alice.handle, "no video", |s| !s.has_video).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_camera_renegotiates_when_replace_unsupported() {
        let hub = MemoryHub::new();
        let alice = party_with(
            &hub,
            EngineConfig::new("alice", CONV),
            SimOptions {
                replace_unsupported: true,
                ..Default::default()
            },
        )
        .await;
        let bob = party(&hub, "bob").await;
        alice.handle.start("bob", CallType::Audio).unwrap();
        wait_state(&bob.handle, CallState::Ringing).await;
        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
        assert!(!bob.handle.snapshot().remote_has_video);

        alice.handle.enable_camera().unwrap();
        wait_for(&bob.handle, "remote video", |s| s.remote_has_video).await;
        let pc = alice.engine.last_connection().unwrap();
        assert_eq!(pc.offers_created(), 2);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(alice.handle.snapshot().state, CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failure_returns_to_idle() {
        let hub = MemoryHub::new();
        let alice = party_with(
            &hub,
            EngineConfig::new("alice", CONV),
            SimOptions {
                deny_user_media: true,
                ..Default::default()
            },
        )
        .await;
        let (_peer, mut inbound) = observer(&hub).await;

        alice.handle.start("bob", CallType::Video).unwrap();
        let snap = wait_for(&alice.handle, "notice", |s| s.notice.is_some()).await;
        assert_eq!(snap.state, CallState::Idle);
        assert!(matches!(snap.notice, Some(CallNotice::SetupFailed(_))));
        settle().await;
        assert!(inbound.try_recv().is_err());
        assert!(alice.log.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_setup_failure_declines() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party_with(
            &hub,
            EngineConfig::new("bob", CONV),
            SimOptions {
                deny_camera: true,
                ..Default::default()
            },
        )
        .await;

        alice.handle.start("bob", CallType::Video).unwrap();
        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Declined));
        let snap = wait_for(&bob.handle, "notice", |s| s.notice.is_some()).await;
        assert_eq!(snap.state, CallState::Idle);
        assert!(matches!(snap.notice, Some(CallNotice::SetupFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let mut patient = EngineConfig::new("bob", CONV);
        patient.setup_timeout = Some(Duration::from_secs(60));
        let bob = party_with(&hub, patient, SimOptions::default()).await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        wait_state(&bob.handle, CallState::Ringing).await;
        time::sleep(Duration::from_secs(44)).await;
        assert_eq!(alice.handle.snapshot().state, CallState::Calling);

        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Unanswered));
        assert_eq!(ended.notice, Some(CallNotice::Unanswered));
        let bob_ended = wait_state(&bob.handle, CallState::Ended).await;
        assert_eq!(bob_ended.end_reason, Some(EndReason::Remote));

        settle().await;
        assert!(alice.log.entries().iter().any(|e| matches!(
            e,
            LogEntry::Update(_, u) if u.status == Some(CallStatus::Missed)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_exactly_one_offer() {
        let hub = MemoryHub::new();
        let (_peer, mut inbound) = observer(&hub).await;
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.handle.start("bob", CallType::Video).unwrap();
        wait_state(&bob.handle, CallState::Ringing).await;
        time::sleep(Duration::from_secs(5)).await;
        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
        time::sleep(Duration::from_secs(1)).await;

        let mut offers = 0;
        let mut answers = 0;
        while let Ok(signal) = inbound.try_recv() {
            match signal {
                Signal::Offer { .. } => offers += 1,
                Signal::Answer { .. } => answers += 1,
                _ => {}
            }
        }
        assert_eq!(offers, 1);
        assert_eq!(answers, 1);
        assert_eq!(alice.engine.last_connection().unwrap().offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringback_stops_when_caller_ends() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        wait_state(&alice.handle, CallState::Calling).await;
        let first = alice.sink.frames.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(5)).await;
        assert!(alice.sink.frames.load(Ordering::SeqCst) > first);

        alice.handle.end().unwrap();
        wait_state(&alice.handle, CallState::Ended).await;
        let at_end = alice.sink.frames.load(Ordering::SeqCst);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(alice.sink.frames.load(Ordering::SeqCst), at_end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringback_stops_on_setup_timeout() {
        let hub = MemoryHub::new();
        let mut impatient = EngineConfig::new("alice", CONV);
        impatient.setup_timeout = Some(Duration::from_secs(5));
        let alice = party_with(&hub, impatient, SimOptions::default()).await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        wait_state(&alice.handle, CallState::Calling).await;
        let ended = wait_state(&alice.handle, CallState::Ended).await;
        assert_eq!(ended.end_reason, Some(EndReason::Unanswered));
        let at_end = alice.sink.frames.load(Ordering::SeqCst);
        assert!(at_end > 0);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(alice.sink.frames.load(Ordering::SeqCst), at_end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_after_share_still_sends_offer() {
        let hub = MemoryHub::new();
        let alice = party_with(
            &hub,
            EngineConfig::new("alice", CONV),
            SimOptions {
                replace_unsupported: true,
                ..Default::default()
            },
        )
        .await;
        let bob = party(&hub, "bob").await;
        alice.handle.start("bob", CallType::Video).unwrap();
        wait_state(&bob.handle, CallState::Ringing).await;
        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;

        alice.handle.toggle_screen_share().unwrap();
        wait_for(&alice.handle, "screen share", |s| s.is_screen_sharing).await;
        time::sleep(Duration::from_millis(50)).await;
        let pc = alice.engine.last_connection().unwrap();
        let before = pc.offers_created();

        alice.engine.update_options(|o| o.deny_camera = true);
        alice.handle.enable_camera().unwrap();
        let snap = wait_for(&alice.handle, "camera notice", |s| s.notice.is_some()).await;
        assert!(matches!(snap.notice, Some(CallNotice::CameraUnavailable(_))));
        assert!(!snap.is_screen_sharing);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pc.offers_created(), before + 1);
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
        assert_eq!(alice.handle.snapshot().state, CallState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_calls_resolve_to_one() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        bob.handle.start("alice", CallType::Audio).unwrap();

        let ringing = wait_state(&bob.handle, CallState::Ringing).await;
        let calling = wait_state(&alice.handle, CallState::Calling).await;
        assert_eq!(ringing.call_id, calling.call_id);
        assert_eq!(ringing.peer_id.as_deref(), Some("alice"));

        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
        let active = wait_state(&bob.handle, CallState::Active).await;
        assert_eq!(active.call_id, calling.call_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_ended_begins_new_call() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        let first = wait_state(&bob.handle, CallState::Ringing).await;
        bob.handle.decline().unwrap();
        wait_state(&alice.handle, CallState::Ended).await;

        alice.handle.start("bob", CallType::Audio).unwrap();
        let second = wait_for(&bob.handle, "second call", |s| {
            s.state == CallState::Ringing && s.call_id != first.call_id
        })
        .await;
        let calling = wait_state(&alice.handle, CallState::Calling).await;
        assert_eq!(calling.call_id, second.call_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_addressed_elsewhere_is_ignored() {
        let hub = MemoryHub::new();
        let bob = party(&hub, "bob").await;
        let (peer, _inbound) = observer(&hub).await;

        peer.send(&Signal::Offer {
            sdp: SessionDescription::offer("v=0\r\n"),
            call_id: "c-1".into(),
            caller_id: "alice".into(),
            callee_id: "dave".into(),
            call_type: CallType::Audio,
        })
        .await;
        settle().await;
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bob.handle.snapshot().state, CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_in_other_conversations() {
        let hub = MemoryHub::new();
        let alice = party(&hub, "alice").await;
        let bob = party(&hub, "bob").await;
        bob.handle.join("side-room").unwrap();
        settle().await;

        alice.handle.start_in("side-room", "bob", CallType::Audio).unwrap();
        let ringing = wait_state(&bob.handle, CallState::Ringing).await;
        assert_eq!(ringing.conversation_id.as_deref(), Some("side-room"));
        bob.handle.answer().unwrap();
        wait_state(&alice.handle, CallState::Active).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_stream_and_shutdown() {
        use futures::StreamExt;

        let hub = MemoryHub::new();
        let engine = Arc::new(SimEngine::new());
        let (handle, task) = spawn(
            EngineConfig::new("alice", CONV),
            Arc::new(hub.client()),
            engine,
            Arc::new(MemoryCallLog::default()),
            Arc::new(NullSink),
        )
        .await
        .unwrap();
        let mut updates = handle.updates();
        let first = updates.next().await.unwrap();
        assert_eq!(first.state, CallState::Idle);

        handle.start("bob", CallType::Audio).unwrap();
        let next = updates.next().await.unwrap();
        assert_eq!(next.state, CallState::Calling);

        handle.shutdown().unwrap();
        tokio_test::assert_ok!(task.await);
        assert!(handle.answer().is_err());
    }
}
