//! The call session actor.
//!
//! One task owns the session: the peer connection, the local media and
//! the store subscriptions. The application talks to it through a
//! [`CallHandle`] (commands with oneshot replies) and listens on a typed
//! [`CallEvent`] channel. Store subscriptions, transport events and the
//! screen-capture watcher are forwarded into one internal queue tagged with
//! the call id, so events from a finished call are simply dropped.

use std::sync::Arc;

use murmur_media::{
    CallStats, DeviceInfo, LocalStream, MediaDevices, MediaPipeline, PeerConnection,
    PeerConnector, PeerEvent, PeerState, QualityProfile, StatsSampler,
};
use murmur_shared::protocol::{
    CallRecord, CallStatus, IceCandidateRecord, IncomingCallPointer, SdpType, SessionDescription,
};
use murmur_shared::{CallId, ConnectionMode, TrackKind, UserId};
use murmur_store::{SignalingStore, StoreError, Subscription};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::ice::{apply_candidates, CandidateBuffer};
use crate::machine::{self, CallState, EndReason, Event, Role, Transition};
use crate::signaling::{decode, CallSignaling};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Everything a session needs from the outside world.
pub struct CallDeps {
    pub uid: UserId,
    pub store: Arc<dyn SignalingStore>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub config: CallConfig,
}

/// Notifications sent *from* the session to the application.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall {
        call_id: CallId,
        from: UserId,
        is_video: bool,
    },
    /// Local preview stream after capture (or a camera switch).
    LocalStream(LocalStream),
    RemoteTrack(TrackKind),
    QualityApplied {
        path: ConnectionMode,
        profile: QualityProfile,
    },
    Stats(CallStats),
    Ended {
        call_id: CallId,
        reason: EndReason,
    },
}

enum Command {
    Call {
        receiver: UserId,
        is_video: bool,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Answer {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Reject {
        call_id: CallId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleVideo {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SwitchCamera {
        reply: oneshot::Sender<Result<DeviceInfo, CallError>>,
    },
    State {
        reply: oneshot::Sender<CallState>,
    },
}

/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::Sender<Command>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CallError::ManagerClosed)?;
        rx.await.map_err(|_| CallError::ManagerClosed)
    }

    /// Ring `receiver`. Any call in progress is torn down first.
    pub async fn call(&self, receiver: &UserId, is_video: bool) -> Result<CallId, CallError> {
        let receiver = receiver.clone();
        self.request(|reply| Command::Call {
            receiver,
            is_video,
            reply,
        })
        .await?
    }

    pub async fn answer(&self, call_id: &CallId) -> Result<(), CallError> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Answer { call_id, reply }).await?
    }

    /// Decline an incoming call. Succeeds if the call is already gone.
    pub async fn reject(&self, call_id: &CallId) -> Result<(), CallError> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Reject { call_id, reply }).await?
    }

    /// Hang up whatever is in progress. Safe to call in any state.
    pub async fn end(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Returns whether the microphone is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await?
    }

    /// Returns whether the camera is now sending.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await?
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartScreenShare { reply }).await?
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StopScreenShare { reply }).await?
    }

    pub async fn switch_camera(&self) -> Result<DeviceInfo, CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await?
    }

    pub async fn state(&self) -> Result<CallState, CallError> {
        self.request(|reply| Command::State { reply }).await
    }
}

pub struct CallManager;

impl CallManager {
    /// Start the session task for `deps.uid` and begin watching for
    /// incoming calls.
    pub async fn spawn(
        deps: CallDeps,
    ) -> Result<(CallHandle, mpsc::Receiver<CallEvent>), CallError> {
        let signaling = CallSignaling::new(deps.store, deps.uid.clone());
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let incoming = signaling.subscribe_incoming().await?;
        let incoming_task = forward(incoming, internal_tx.clone(), Internal::Incoming);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        info!(uid = %deps.uid.short(), "call manager started");
        let actor = Actor {
            me: deps.uid,
            signaling,
            devices: deps.devices,
            connector: deps.connector,
            config: deps.config,
            state: CallState::Idle,
            session: None,
            events: event_tx,
            internal: internal_tx,
        };
        tokio::spawn(actor.run(cmd_rx, internal_rx, incoming_task));

        Ok((CallHandle { tx: cmd_tx }, event_rx))
    }
}

enum Internal {
    Incoming(Option<Value>),
    Record(CallId, Option<Value>),
    Candidate(CallId, Value),
    Peer(CallId, PeerEvent),
    ScreenEnded(CallId, String),
}

fn forward<T: Send + 'static>(
    mut sub: Subscription<T>,
    tx: mpsc::UnboundedSender<Internal>,
    wrap: impl Fn(T) -> Internal + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = sub.next().await {
            if tx.send(wrap(item)).is_err() {
                break;
            }
        }
    })
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct LiveMedia {
    pc: Arc<dyn PeerConnection>,
    pipeline: MediaPipeline,
    sampler: StatsSampler,
    next_stats: Option<Instant>,
}

struct Session {
    call_id: CallId,
    counterpart: UserId,
    role: Role,
    buffer: CandidateBuffer,
    /// The record has been observed at least once, so its absence now
    /// means deletion rather than "not written yet".
    record_seen: bool,
    deadline: Option<Instant>,
    media: Option<LiveMedia>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn new(call_id: CallId, counterpart: UserId, role: Role) -> Self {
        Self {
            call_id,
            counterpart,
            role,
            buffer: CandidateBuffer::new(),
            record_seen: false,
            deadline: None,
            media: None,
            tasks: Vec::new(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Actor {
    me: UserId,
    signaling: CallSignaling,
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    config: CallConfig,
    state: CallState,
    session: Option<Session>,
    events: mpsc::Sender<CallEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        incoming_task: JoinHandle<()>,
    ) {
        loop {
            let deadline = self.session.as_ref().and_then(|s| s.deadline);
            let stats_at = self
                .session
                .as_ref()
                .and_then(|s| s.media.as_ref())
                .and_then(|m| m.next_stats);

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        info!(uid = %self.me.short(), "call handles dropped, shutting down");
                        break;
                    }
                },
                Some(msg) = internal.recv() => self.handle_internal(msg).await,
                _ = sleep_until_opt(deadline) => self.on_ring_timeout().await,
                _ = sleep_until_opt(stats_at) => self.sample_stats().await,
            }
        }

        self.apply(Event::HungUp).await;
        incoming_task.abort();
    }

    // ---------------------------------------------------------------------
    // State plumbing
    // ---------------------------------------------------------------------

    async fn emit(&self, event: CallEvent) {
        // nobody listening is fine
        let _ = self.events.send(event).await;
    }

    async fn apply(&mut self, event: Event) {
        match machine::transition(&self.state, &event) {
            Transition::Stay => trace!(state = self.state.name(), ?event, "event ignored"),
            Transition::Move(next) => self.set_state(next).await,
            Transition::End(reason) => self.teardown(reason).await,
        }
    }

    async fn set_state(&mut self, next: CallState) {
        info!(
            from = self.state.name(),
            to = next.name(),
            call_id = next.call_id().map(CallId::as_str).unwrap_or("-"),
            "call state changed"
        );
        self.state = next.clone();
        self.emit(CallEvent::StateChanged(next)).await;
    }

    fn is_current(&self, call_id: &CallId) -> bool {
        self.session.as_ref().is_some_and(|s| &s.call_id == call_id)
    }

    fn media_mut(&mut self) -> Result<&mut LiveMedia, CallError> {
        self.session
            .as_mut()
            .and_then(|s| s.media.as_mut())
            .ok_or_else(|| CallError::InvalidState("no active media".into()))
    }

    async fn connect(&self) -> Result<(Arc<dyn PeerConnection>, Subscription<PeerEvent>), CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = self.connector.connect(tx).await?;
        Ok((pc, Subscription::new(rx)))
    }

    /// Subscribe to the current session's record and candidate list.
    async fn watch_session(&mut self) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let call_id = session.call_id.clone();

        let record = self.signaling.subscribe_call(&call_id).await?;
        let id = call_id.clone();
        session.tasks.push(forward(record, self.internal.clone(), move |value| {
            Internal::Record(id.clone(), value)
        }));

        let candidates = self.signaling.subscribe_candidates(&call_id).await?;
        let id = call_id;
        session.tasks.push(forward(candidates, self.internal.clone(), move |(_, value)| {
            Internal::Candidate(id.clone(), value)
        }));
        Ok(())
    }

    fn install_media(&mut self, pc: Arc<dyn PeerConnection>, pipeline: MediaPipeline, events: Subscription<PeerEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let id = session.call_id.clone();
        session.tasks.push(forward(events, self.internal.clone(), move |event| {
            Internal::Peer(id.clone(), event)
        }));
        session.media = Some(LiveMedia {
            pc,
            pipeline,
            sampler: StatsSampler::new(),
            next_stats: None,
        });
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call {
                receiver,
                is_video,
                reply,
            } => {
                let result = self.call(receiver, is_video).await;
                let _ = reply.send(result);
            }
            Command::Answer { call_id, reply } => {
                let result = self.answer(call_id).await;
                let _ = reply.send(result);
            }
            Command::Reject { call_id, reply } => {
                let result = self.reject(call_id).await;
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.apply(Event::HungUp).await;
                let _ = reply.send(());
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            Command::StartScreenShare { reply } => {
                let result = self.start_screen_share().await;
                let _ = reply.send(result);
            }
            Command::StopScreenShare { reply } => {
                let result = match self.media_mut() {
                    Ok(media) => media
                        .pipeline
                        .stop_screen_share(media.pc.as_ref())
                        .await
                        .map_err(CallError::from),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::SwitchCamera { reply } => {
                let result = self.switch_camera().await;
                let _ = reply.send(result);
            }
            Command::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn call(&mut self, receiver: UserId, is_video: bool) -> Result<CallId, CallError> {
        if receiver == self.me {
            return Err(CallError::InvalidState("cannot call yourself".into()));
        }
        if self.state.is_live() {
            self.apply(Event::Superseded).await;
        }
        if self.signaling.is_busy(&receiver).await? {
            info!(peer = %receiver.short(), "receiver is busy");
            return Err(CallError::Busy);
        }

        let call_id = CallId::new(&self.me, &receiver, now_ms());
        let mut pipeline = MediaPipeline::new(self.devices.clone());
        let stream = pipeline.acquire(is_video).await?;
        let (pc, peer_events) = self.connect().await?;

        let offer = match negotiate_offer(&pipeline, pc.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                close_quietly(pc.as_ref()).await;
                return Err(e);
            }
        };

        let record = CallRecord {
            caller_id: self.me.clone(),
            receiver_id: receiver.clone(),
            status: CallStatus::Calling,
            is_video,
            offer: Some(offer),
            answer: None,
            timestamp: now_ms(),
            ended_at: None,
        };
        if let Err(e) = self.signaling.create_call(&call_id, &record).await {
            close_quietly(pc.as_ref()).await;
            return Err(e.into());
        }

        let mut session = Session::new(call_id.clone(), receiver, Role::Caller);
        session.deadline = Some(Instant::now() + self.config.ring_timeout);
        self.session = Some(session);
        self.install_media(pc, pipeline, peer_events);
        self.apply(Event::Dialed(call_id.clone())).await;

        if let Err(e) = self.watch_session().await {
            error!(call_id = %call_id, error = %e, "could not watch call record");
            self.teardown(EndReason::ConnectionFailed).await;
            return Err(e);
        }

        info!(call_id = %call_id, is_video, "outgoing call placed");
        self.emit(CallEvent::LocalStream(stream)).await;
        Ok(call_id)
    }

    async fn answer(&mut self, call_id: CallId) -> Result<(), CallError> {
        let ringing_this = self.is_current(&call_id);
        if ringing_this && self.session.as_ref().is_some_and(|s| s.media.is_some()) {
            return Err(CallError::InvalidState("call already answered".into()));
        }
        if !ringing_this && self.state.is_live() {
            self.apply(Event::Superseded).await;
        }

        let record = match self.signaling.read_call(&call_id).await? {
            Some(record)
                if record.status == CallStatus::Calling && record.receiver_id == self.me =>
            {
                record
            }
            _ => {
                if ringing_this {
                    self.teardown(EndReason::RemoteHangup).await;
                }
                return Err(CallError::CallNotFound(call_id));
            }
        };
        let offer = record
            .offer
            .clone()
            .ok_or_else(|| CallError::InvalidState("call record has no offer".into()))?
            .require(SdpType::Offer)
            .map_err(|e| CallError::InvalidState(e.to_string()))?;

        if !ringing_this {
            self.session = Some(Session::new(call_id.clone(), record.caller_id.clone(), Role::Callee));
            self.apply(Event::Rang(call_id.clone())).await;
            if let Err(e) = self.watch_session().await {
                self.teardown(EndReason::ConnectionFailed).await;
                return Err(e);
            }
        }

        // a capture failure leaves the call ringing so it can still be rejected
        let mut pipeline = MediaPipeline::new(self.devices.clone());
        let stream = pipeline.acquire(record.is_video).await?;
        let (pc, peer_events) = self.connect().await?;
        self.install_media(pc, pipeline, peer_events);

        let answer = match self.negotiate_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(call_id = %call_id, error = %e, "could not answer call");
                self.teardown(EndReason::ConnectionFailed).await;
                return Err(e);
            }
        };

        match self
            .signaling
            .transition_status(&call_id, CallStatus::Calling, CallStatus::Accepted)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!(call_id = %call_id, "call settled before it could be accepted");
                self.teardown(EndReason::RemoteHangup).await;
                return Err(CallError::CallNotFound(call_id));
            }
            Err(e) => {
                self.teardown(EndReason::ConnectionFailed).await;
                return Err(e.into());
            }
        }

        if let Err(e) = self
            .signaling
            .publish_answer(&call_id, &record.caller_id, &answer)
            .await
        {
            error!(call_id = %call_id, error = %e, "could not publish answer");
            self.teardown(EndReason::ConnectionFailed).await;
            return Err(e.into());
        }

        self.apply(Event::Answered).await;
        info!(call_id = %call_id, peer = %record.caller_id.short(), "call answered");
        self.emit(CallEvent::LocalStream(stream)).await;
        Ok(())
    }

    /// Attach tracks, apply the offer, replay buffered candidates and
    /// create the answer.
    async fn negotiate_answer(&mut self, offer: SessionDescription) -> Result<SessionDescription, CallError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CallError::InvalidState("no session".into()))?;
        let media = session
            .media
            .as_ref()
            .ok_or_else(|| CallError::InvalidState("no active media".into()))?;

        media.pipeline.attach(media.pc.as_ref()).await?;
        media.pc.set_remote_description(offer).await?;
        let buffered = session.buffer.mark_remote_ready();
        if !buffered.is_empty() {
            let total = buffered.len();
            let applied = apply_candidates(media.pc.as_ref(), buffered).await;
            debug!(total, applied, "replayed buffered candidates");
        }
        Ok(media.pc.create_answer().await?)
    }

    async fn reject(&mut self, call_id: CallId) -> Result<(), CallError> {
        if self.is_current(&call_id) {
            return match self.state {
                CallState::Ringing(_) => {
                    self.apply(Event::HungUp).await;
                    Ok(())
                }
                _ => Err(CallError::InvalidState("only a ringing call can be rejected".into())),
            };
        }

        // not ringing here (any more): settle the shared record directly
        let Some(record) = self.signaling.read_call(&call_id).await? else {
            self.signaling.clear_incoming_if(&self.me, &call_id).await?;
            return Ok(());
        };
        if record.receiver_id != self.me {
            return Err(CallError::CallNotFound(call_id));
        }
        if record.status == CallStatus::Calling {
            self.signaling
                .transition_status(&call_id, CallStatus::Calling, CallStatus::Rejected)
                .await?;
        }
        self.signaling
            .clear_presence(&[&self.me, &record.caller_id])
            .await?;
        self.signaling.clear_incoming_if(&self.me, &call_id).await?;
        debug!(call_id = %call_id, "reject settled without a local session");
        Ok(())
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let media = self.media_mut()?;
        let muted = !media.pipeline.is_muted();
        media.pipeline.set_muted(muted);
        Ok(muted)
    }

    fn toggle_video(&mut self) -> Result<bool, CallError> {
        let media = self.media_mut()?;
        if !media.pipeline.is_video() {
            return Err(CallError::InvalidState("audio-only call".into()));
        }
        let enabled = !media.pipeline.is_video_enabled();
        media.pipeline.set_video_enabled(enabled);
        Ok(enabled)
    }

    async fn start_screen_share(&mut self) -> Result<(), CallError> {
        let tx = self.internal.clone();
        let media = self.media_mut()?;
        let track = media.pipeline.start_screen_share(media.pc.as_ref()).await?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let call_id = session.call_id.clone();
        let track_id = track.id().to_string();
        session.tasks.push(tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(Internal::ScreenEnded(call_id, track_id));
        }));
        Ok(())
    }

    async fn switch_camera(&mut self) -> Result<DeviceInfo, CallError> {
        let media = self.media_mut()?;
        let device = media.pipeline.switch_camera(media.pc.as_ref()).await?;
        let stream = media.pipeline.stream().cloned();
        if let Some(stream) = stream {
            self.emit(CallEvent::LocalStream(stream)).await;
        }
        Ok(device)
    }

    // ---------------------------------------------------------------------
    // Observations
    // ---------------------------------------------------------------------

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Incoming(value) => self.on_incoming(value).await,
            Internal::Record(id, value) if self.is_current(&id) => self.on_record(value).await,
            Internal::Candidate(id, value) if self.is_current(&id) => {
                self.on_remote_candidate(value).await
            }
            Internal::Peer(id, event) if self.is_current(&id) => self.on_peer_event(event).await,
            Internal::ScreenEnded(id, track_id) if self.is_current(&id) => {
                self.on_screen_ended(track_id).await
            }
            _ => trace!("dropping event for a finished call"),
        }
    }

    async fn on_incoming(&mut self, value: Option<Value>) {
        let Some(value) = value else {
            return;
        };
        let pointer: IncomingCallPointer = match decode(value) {
            Ok(pointer) => pointer,
            Err(e) => {
                warn!(error = %e, "malformed incoming call pointer");
                return;
            }
        };
        if self.state.is_live() {
            if !self.is_current(&pointer.call_id) {
                debug!(call_id = %pointer.call_id, "incoming call while busy, ignoring");
            }
            return;
        }

        match self.signaling.read_call(&pointer.call_id).await {
            Ok(Some(record))
                if record.status == CallStatus::Calling && record.receiver_id == self.me => {}
            Ok(_) => {
                debug!(call_id = %pointer.call_id, "clearing stale incoming call pointer");
                if let Err(e) = self.signaling.clear_incoming_if(&self.me, &pointer.call_id).await {
                    warn!(error = %e, "could not clear stale incoming call pointer");
                }
                return;
            }
            Err(e) => {
                warn!(call_id = %pointer.call_id, error = %e, "could not read incoming call");
                return;
            }
        }

        let call_id = pointer.call_id.clone();
        self.session = Some(Session::new(call_id.clone(), pointer.from.clone(), Role::Callee));
        if let Err(e) = self.watch_session().await {
            warn!(call_id = %call_id, error = %e, "could not watch incoming call");
            self.session = None;
            return;
        }

        self.apply(Event::Rang(call_id.clone())).await;
        info!(call_id = %call_id, from = %pointer.from.short(), is_video = pointer.is_video, "incoming call");
        self.emit(CallEvent::IncomingCall {
            call_id,
            from: pointer.from,
            is_video: pointer.is_video,
        })
        .await;
    }

    async fn on_record(&mut self, value: Option<Value>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(value) = value else {
            if session.record_seen {
                info!(call_id = %session.call_id, "call record deleted");
                self.apply(Event::RecordDeleted).await;
            }
            return;
        };
        session.record_seen = true;

        let record: CallRecord = match decode(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(call_id = %session.call_id, error = %e, "malformed call record");
                return;
            }
        };
        if record.status.is_terminal() {
            self.apply(Event::RemoteTerminal(record.status)).await;
            return;
        }
        if session.role != Role::Caller {
            return;
        }

        if record.status == CallStatus::Accepted && session.deadline.take().is_some() {
            info!(call_id = %session.call_id, "call accepted, ring timeout cancelled");
        }
        if let Some(answer) = record.answer {
            self.apply_remote_answer(answer).await;
        } else if record.status == CallStatus::Accepted {
            self.apply(Event::RemoteAccepted).await;
        }
    }

    async fn apply_remote_answer(&mut self, answer: SessionDescription) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(media) = session.media.as_ref() else {
            return;
        };
        if media.pc.has_remote_description().await {
            return;
        }

        let applied = match answer.require(SdpType::Answer) {
            Ok(answer) => media
                .pc
                .set_remote_description(answer)
                .await
                .map_err(CallError::from),
            Err(e) => Err(CallError::InvalidState(e.to_string())),
        };
        if let Err(e) = applied {
            error!(call_id = %session.call_id, error = %e, "could not apply remote answer");
            self.apply(Event::TransportDown).await;
            return;
        }

        session.deadline = None;
        let buffered = session.buffer.mark_remote_ready();
        let total = buffered.len();
        let replayed = apply_candidates(media.pc.as_ref(), buffered).await;
        info!(call_id = %session.call_id, buffered = total, replayed, "remote answer applied");
        self.apply(Event::RemoteAnswered).await;
    }

    async fn on_remote_candidate(&mut self, value: Value) {
        let record: IceCandidateRecord = match decode(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "malformed candidate record");
                return;
            }
        };
        if record.from == self.me {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(candidate) = session.buffer.offer(record.candidate) else {
            debug!(call_id = %session.call_id, buffered = session.buffer.len(), "remote candidate buffered");
            return;
        };
        if let Some(media) = session.media.as_ref() {
            apply_candidates(media.pc.as_ref(), [candidate]).await;
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                let record = IceCandidateRecord {
                    candidate,
                    from: self.me.clone(),
                    timestamp: now_ms(),
                };
                if let Err(e) = self.signaling.push_candidate(&session.call_id, &record).await {
                    warn!(call_id = %session.call_id, error = %e, "could not publish local candidate");
                }
            }
            PeerEvent::StateChanged(PeerState::Connected) => self.on_transport_up().await,
            PeerEvent::StateChanged(state @ (PeerState::Failed | PeerState::Disconnected)) => {
                warn!(?state, "media transport lost");
                self.apply(Event::TransportDown).await;
            }
            PeerEvent::StateChanged(state) => debug!(?state, "peer state"),
            PeerEvent::RemoteTrack(kind) => {
                debug!(%kind, "remote track");
                self.emit(CallEvent::RemoteTrack(kind)).await;
            }
        }
    }

    async fn on_transport_up(&mut self) {
        let interval = self.config.stats_interval;
        let Some(media) = self.session.as_mut().and_then(|s| s.media.as_mut()) else {
            return;
        };
        let path = media.pc.selected_path().await;
        let profile = match media.pipeline.apply_quality(media.pc.as_ref(), path).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(?path, error = %e, "could not apply quality profile");
                None
            }
        };
        media.sampler.reset();
        media.next_stats = Some(Instant::now() + interval);

        info!(?path, "media transport connected");
        if let Some(profile) = profile {
            self.emit(CallEvent::QualityApplied { path, profile }).await;
        }
        self.apply(Event::TransportUp(path)).await;
    }

    async fn sample_stats(&mut self) {
        let interval = self.config.stats_interval;
        let Some(media) = self.session.as_mut().and_then(|s| s.media.as_mut()) else {
            return;
        };
        media.next_stats = Some(Instant::now() + interval);
        let stats = match media.pc.raw_stats().await {
            Ok(raw) => media.sampler.sample(raw),
            Err(e) => {
                debug!(error = %e, "stats unavailable");
                return;
            }
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events.try_send(CallEvent::Stats(stats)) {
            trace!("event queue full, dropping stats sample");
        }
    }

    async fn on_screen_ended(&mut self, track_id: String) {
        let Ok(media) = self.media_mut() else {
            return;
        };
        let current = media
            .pipeline
            .screen_track()
            .is_some_and(|track| track.id() == track_id);
        if !current {
            return;
        }
        info!("screen capture ended, restoring camera");
        if let Err(e) = media.pipeline.stop_screen_share(media.pc.as_ref()).await {
            warn!(error = %e, "could not restore camera after screen share");
        }
    }

    async fn on_ring_timeout(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.deadline = None;
        let call_id = session.call_id.clone();

        match self
            .signaling
            .transition_status(&call_id, CallStatus::Calling, CallStatus::Ended)
            .await
        {
            Ok(true) => {
                if let Err(e) = self.signaling.mark_ended_at(&call_id, now_ms()).await {
                    warn!(call_id = %call_id, error = %e, "could not stamp timed out call");
                }
            }
            Ok(false) => match self.signaling.status(&call_id).await {
                Ok(Some(CallStatus::Accepted)) => {
                    info!(call_id = %call_id, "answered just before the ring timeout");
                    return;
                }
                Ok(status) => debug!(call_id = %call_id, ?status, "ring timeout lost the status race"),
                Err(e) => warn!(call_id = %call_id, error = %e, "could not read call status"),
            },
            Err(e) => warn!(call_id = %call_id, error = %e, "could not mark call timed out"),
        }

        info!(call_id = %call_id, "no answer, giving up");
        self.apply(Event::TimedOut).await;
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// The only way a session ends. Local media goes first so it is
    /// released even when the store is unreachable.
    async fn teardown(&mut self, reason: EndReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        for task in session.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut media) = session.media.take() {
            media.pipeline.stop_all();
            if let Err(e) = media.pc.close().await {
                warn!(call_id = %session.call_id, error = %e, "could not close peer connection");
            }
        }

        self.release_shared(&session, reason).await;
        self.schedule_deletion(session.call_id.clone());

        let call_id = session.call_id.clone();
        match reason.as_error() {
            Some(err) => error!(call_id = %call_id, ?reason, error = %err, "call torn down"),
            None => info!(call_id = %call_id, ?reason, "call ended"),
        }
        self.set_state(CallState::Ended(call_id.clone(), reason)).await;
        self.emit(CallEvent::Ended { call_id, reason }).await;
    }

    /// Best-effort writes: terminal status, presence flags, the incoming
    /// pointer. Each failure is logged and the rest still run.
    async fn release_shared(&self, session: &Session, reason: EndReason) {
        let call_id = &session.call_id;

        if reason != EndReason::RecordDeleted {
            let written = if session.role == Role::Callee && reason == EndReason::Rejected {
                self.signaling
                    .transition_status(call_id, CallStatus::Calling, CallStatus::Rejected)
                    .await
            } else {
                self.mark_ended(call_id).await
            };
            if let Err(e) = written {
                warn!(call_id = %call_id, error = %e, "could not write terminal status");
            }
        }

        if let Err(e) = self
            .signaling
            .clear_presence(&[&self.me, &session.counterpart])
            .await
        {
            warn!(call_id = %call_id, error = %e, "could not clear presence");
        }

        let pointer_owner = match session.role {
            Role::Caller => &session.counterpart,
            Role::Callee => &self.me,
        };
        if let Err(e) = self.signaling.clear_incoming_if(pointer_owner, call_id).await {
            warn!(call_id = %call_id, error = %e, "could not clear incoming call pointer");
        }
    }

    /// `calling|accepted -> ended`, stamping `endedAt` when this side won.
    async fn mark_ended(&self, call_id: &CallId) -> Result<bool, StoreError> {
        let mut swapped = self
            .signaling
            .transition_status(call_id, CallStatus::Calling, CallStatus::Ended)
            .await?;
        if !swapped {
            swapped = self
                .signaling
                .transition_status(call_id, CallStatus::Accepted, CallStatus::Ended)
                .await?;
        }
        if swapped {
            self.signaling.mark_ended_at(call_id, now_ms()).await?;
        }
        Ok(swapped)
    }

    fn schedule_deletion(&self, call_id: CallId) {
        let signaling = self.signaling.clone();
        let delay = self.config.teardown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match signaling.delete_call(&call_id).await {
                Ok(()) => debug!(call_id = %call_id, "call record deleted"),
                Err(e) => warn!(call_id = %call_id, error = %e, "could not delete call record"),
            }
        });
    }
}

async fn negotiate_offer(
    pipeline: &MediaPipeline,
    pc: &dyn PeerConnection,
) -> Result<SessionDescription, CallError> {
    pipeline.attach(pc).await?;
    Ok(pc.create_offer().await?)
}

async fn close_quietly(pc: &dyn PeerConnection) {
    if let Err(e) = pc.close().await {
        debug!(error = %e, "close after failed setup");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use murmur_media::testing::{RecordingConnector, RecordingPeer};
    use murmur_media::{MediaError, RawStats, SyntheticDevices, TrackSource};
    use murmur_shared::paths;
    use murmur_shared::protocol::IceCandidate;
    use murmur_store::MemoryStore;
    use serde_json::json;

    struct Side {
        uid: UserId,
        handle: CallHandle,
        events: mpsc::Receiver<CallEvent>,
        connector: Arc<RecordingConnector>,
        devices: Arc<SyntheticDevices>,
    }

    impl Side {
        async fn new(store: &Arc<MemoryStore>, uid: &str) -> Self {
            Self::with_devices(store, uid, SyntheticDevices::new()).await
        }

        async fn with_devices(store: &Arc<MemoryStore>, uid: &str, devices: SyntheticDevices) -> Self {
            let connector = Arc::new(RecordingConnector::new());
            let devices = Arc::new(devices);
            let (handle, events) = CallManager::spawn(CallDeps {
                uid: UserId::from(uid),
                store: store.clone(),
                devices: devices.clone(),
                connector: connector.clone(),
                config: CallConfig::default(),
            })
            .await
            .unwrap();
            Self {
                uid: UserId::from(uid),
                handle,
                events,
                connector,
                devices,
            }
        }

        fn peer(&self) -> Arc<RecordingPeer> {
            self.connector.last().expect("no peer connection yet")
        }

        async fn wait_for(&mut self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(120), self.events.recv())
                    .await
                    .expect("timed out waiting for a call event")
                    .expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        }

        async fn wait_ended(&mut self) -> EndReason {
            match self.wait_for(|e| matches!(e, CallEvent::Ended { .. })).await {
                CallEvent::Ended { reason, .. } => reason,
                _ => unreachable!(),
            }
        }

        async fn wait_connected(&mut self) {
            self.wait_for(|e| matches!(e, CallEvent::StateChanged(CallState::Connected(_))))
                .await;
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn status(store: &MemoryStore, call_id: &CallId) -> Option<Value> {
        store.read(&paths::call_status(call_id)).await.unwrap()
    }

    async fn connected_pair(store: &Arc<MemoryStore>, is_video: bool) -> (Side, Side, CallId) {
        let mut alice = Side::new(store, "alice").await;
        let mut bob = Side::new(store, "bob").await;
        let call_id = alice.handle.call(&bob.uid, is_video).await.unwrap();
        bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
        bob.handle.answer(&call_id).await.unwrap();
        alice.wait_connected().await;
        (alice, bob, call_id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_call_from_dial_to_hangup() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Side::new(&store, "alice").await;
        let mut bob = Side::new(&store, "bob").await;

        let call_id = alice.handle.call(&bob.uid, true).await.unwrap();
        assert_eq!(
            alice.handle.state().await.unwrap(),
            CallState::Calling(call_id.clone())
        );

        match bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await {
            CallEvent::IncomingCall {
                call_id: incoming,
                from,
                is_video,
            } => {
                assert_eq!(incoming, call_id);
                assert_eq!(from, alice.uid);
                assert!(is_video);
            }
            _ => unreachable!(),
        }

        // trickled before bob has anything to apply them to
        let alice_peer = alice.peer();
        alice_peer.emit(PeerEvent::LocalCandidate(IceCandidate::new("candidate:a1")));
        alice_peer.emit(PeerEvent::LocalCandidate(IceCandidate::new("candidate:a2")));
        settle().await;

        bob.handle.answer(&call_id).await.unwrap();
        let bob_peer = bob.peer();
        assert_eq!(bob_peer.applied_candidates(), vec!["candidate:a1", "candidate:a2"]);

        alice.wait_connected().await;
        assert_eq!(
            alice_peer.remote_description().unwrap().sdp_type,
            SdpType::Answer
        );
        assert_eq!(status(&store, &call_id).await, Some(json!("accepted")));
        assert_eq!(store.read("users/bob/incomingCall").await.unwrap(), None);

        // well past the ring timeout, an accepted call stays up
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(
            alice.handle.state().await.unwrap(),
            CallState::Connected(call_id.clone())
        );

        alice_peer.emit(PeerEvent::StateChanged(PeerState::Connected));
        match alice
            .wait_for(|e| matches!(e, CallEvent::QualityApplied { .. }))
            .await
        {
            CallEvent::QualityApplied { path, profile } => {
                assert_eq!(path, ConnectionMode::Direct);
                assert_eq!(profile, QualityProfile::DIRECT);
            }
            _ => unreachable!(),
        }

        alice.handle.end().await.unwrap();
        assert_eq!(bob.wait_ended().await, EndReason::RemoteHangup);
        assert_eq!(alice.devices.live_track_count(), 0);
        assert_eq!(bob.devices.live_track_count(), 0);
        assert!(alice_peer.is_closed());
        assert!(bob_peer.is_closed());
        assert_eq!(status(&store, &call_id).await, Some(json!("ended")));
        assert_eq!(store.read("users/alice/userInCall").await.unwrap(), None);
        assert_eq!(store.read("users/bob/userInCall").await.unwrap(), None);

        // the record and its candidates disappear after the teardown delay
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.read(&paths::call(&call_id)).await.unwrap(), None);
        assert_eq!(store.read(&paths::ice_candidates(&call_id)).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out_once() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Side::new(&store, "alice").await;
        let mut bob = Side::new(&store, "bob").await;

        let call_id = alice.handle.call(&bob.uid, false).await.unwrap();
        bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await;

        assert_eq!(alice.wait_ended().await, EndReason::Timeout);
        assert_eq!(status(&store, &call_id).await, Some(json!("ended")));
        assert!(store
            .read(&paths::call_ended_at(&call_id))
            .await
            .unwrap()
            .is_some());
        assert_eq!(alice.devices.live_track_count(), 0);

        assert_eq!(bob.wait_ended().await, EndReason::RemoteHangup);
        assert!(matches!(
            bob.handle.answer(&call_id).await,
            Err(CallError::CallNotFound(_))
        ));
        assert!(bob.connector.peers().is_empty());
        assert!(bob.devices.issued_tracks().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        while let Ok(event) = alice.events.try_recv() {
            assert!(!matches!(event, CallEvent::Ended { .. }), "ended twice");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_candidates_replayed_in_order_after_answer() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Side::new(&store, "alice").await;
        let bob = UserId::from("bob");

        let call_id = alice.handle.call(&bob, false).await.unwrap();
        let peer = alice.peer();
        peer.reject_candidate("candidate:b2");

        // bob's side, driven straight through the store
        let remote = CallSignaling::new(store.clone(), bob.clone());
        let push = |candidate: &'static str, timestamp: i64| {
            let remote = remote.clone();
            let call_id = call_id.clone();
            let bob = bob.clone();
            async move {
                let record = IceCandidateRecord {
                    candidate: IceCandidate::new(candidate),
                    from: bob,
                    timestamp,
                };
                remote.push_candidate(&call_id, &record).await.unwrap();
            }
        };
        push("candidate:b1", 1).await;
        push("candidate:b2", 2).await;
        push("candidate:b3", 3).await;
        settle().await;
        assert!(peer.applied_candidates().is_empty());

        assert!(remote
            .transition_status(&call_id, CallStatus::Calling, CallStatus::Accepted)
            .await
            .unwrap());
        remote
            .publish_answer(&call_id, &alice.uid, &SessionDescription::answer("v=0 bob"))
            .await
            .unwrap();
        alice.wait_connected().await;
        assert_eq!(peer.applied_candidates(), vec!["candidate:b1", "candidate:b3"]);

        push("candidate:b4", 4).await;
        settle().await;
        assert_eq!(
            peer.applied_candidates(),
            vec!["candidate:b1", "candidate:b3", "candidate:b4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_releases_media_even_when_store_is_unreachable() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;

        alice.handle.call(&UserId::from("bob"), true).await.unwrap();
        assert_eq!(alice.devices.live_track_count(), 2);

        store.set_offline(true);
        alice.handle.end().await.unwrap();
        assert_eq!(alice.devices.live_track_count(), 0);
        assert!(alice.peer().is_closed());
        assert!(matches!(
            alice.handle.state().await.unwrap(),
            CallState::Ended(_, EndReason::LocalHangup)
        ));

        // nothing left to end
        alice.handle.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_while_idle_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;
        alice.handle.end().await.unwrap();
        assert_eq!(alice.handle.state().await.unwrap(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Side::new(&store, "alice").await;
        let mut bob = Side::new(&store, "bob").await;

        let call_id = alice.handle.call(&bob.uid, false).await.unwrap();
        bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await;

        bob.handle.reject(&call_id).await.unwrap();
        bob.handle.reject(&call_id).await.unwrap();

        assert_eq!(alice.wait_ended().await, EndReason::Rejected);
        assert_eq!(status(&store, &call_id).await, Some(json!("rejected")));
        assert_eq!(alice.devices.live_track_count(), 0);
        assert_eq!(store.read("users/bob/incomingCall").await.unwrap(), None);
        assert!(bob.connector.peers().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.read(&paths::call(&call_id)).await.unwrap(), None);
        bob.handle.reject(&call_id).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_up_a_ringing_call_rejects_it() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Side::new(&store, "alice").await;
        let mut bob = Side::new(&store, "bob").await;

        let call_id = alice.handle.call(&bob.uid, true).await.unwrap();
        bob.wait_for(|e| matches!(e, CallEvent::IncomingCall { .. })).await;
        bob.handle.end().await.unwrap();

        assert_eq!(bob.wait_ended().await, EndReason::Rejected);
        assert_eq!(alice.wait_ended().await, EndReason::Rejected);
        assert_eq!(status(&store, &call_id).await, Some(json!("rejected")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_receiver_is_refused_before_capture() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;
        store
            .write("users/bob/userInCall", json!(true))
            .await
            .unwrap();

        let err = alice.handle.call(&UserId::from("bob"), true).await.unwrap_err();
        assert!(matches!(err, CallError::Busy));
        assert!(alice.devices.issued_tracks().is_empty());
        assert_eq!(alice.handle.state().await.unwrap(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calling_yourself_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;
        let err = alice.handle.call(&alice.uid, false).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answering_a_missing_call() {
        let store = Arc::new(MemoryStore::new());
        let bob = Side::new(&store, "bob").await;
        let missing = CallId::new(&UserId::from("alice"), &bob.uid, 42);

        assert!(matches!(
            bob.handle.answer(&missing).await,
            Err(CallError::CallNotFound(_))
        ));
        assert!(bob.devices.issued_tracks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_capture_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let devices = SyntheticDevices::new();
        devices.set_denied(true);
        let alice = Side::with_devices(&store, "alice", devices).await;

        let err = alice.handle.call(&UserId::from("bob"), true).await.unwrap_err();
        assert!(matches!(err, CallError::MediaUnavailable(_)));
        assert_eq!(store.read("calls").await.unwrap(), None);
        assert_eq!(store.read("users/bob/incomingCall").await.unwrap(), None);
        assert!(alice.connector.peers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_microphone_refuses_the_call() {
        let store = Arc::new(MemoryStore::new());
        let alice =
            Side::with_devices(&store, "alice", SyntheticDevices::new().without_microphone()).await;

        let err = alice.handle.call(&UserId::from("bob"), false).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::MediaUnavailable(MediaError::DeviceUnavailable(_))
        ));
        assert_eq!(store.read("calls").await.unwrap(), None);
        assert_eq!(alice.handle.state().await.unwrap(), CallState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connector_failure_releases_capture() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;
        alice.connector.set_fail(true);

        let err = alice.handle.call(&UserId::from("bob"), true).await.unwrap_err();
        assert!(matches!(err, CallError::ConnectionFailed(_)));
        assert_eq!(alice.devices.issued_tracks().len(), 2);
        assert_eq!(alice.devices.live_track_count(), 0);
        assert_eq!(store.read("calls").await.unwrap(), None);
        assert_eq!(store.read("users/bob/incomingCall").await.unwrap(), None);
        assert_eq!(alice.handle.state().await.unwrap(), CallState::Idle);

        // the next attempt goes through once the stack is back
        alice.connector.set_fail(false);
        alice.handle.call(&UserId::from("bob"), true).await.unwrap();
        assert_eq!(alice.connector.peers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_tears_down_both_sides() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, mut bob, call_id) = connected_pair(&store, true).await;

        bob.peer().emit(PeerEvent::StateChanged(PeerState::Failed));
        assert_eq!(bob.wait_ended().await, EndReason::ConnectionFailed);
        assert_eq!(bob.devices.live_track_count(), 0);

        assert_eq!(alice.wait_ended().await, EndReason::RemoteHangup);
        assert_eq!(alice.devices.live_track_count(), 0);
        assert_eq!(status(&store, &call_id).await, Some(json!("ended")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call_supersedes_the_old_one() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;

        let first = alice.handle.call(&UserId::from("bob"), false).await.unwrap();
        let first_peer = alice.peer();
        let second = alice.handle.call(&UserId::from("carol"), false).await.unwrap();

        assert_ne!(first, second);
        assert!(first_peer.is_closed());
        assert_eq!(status(&store, &first).await, Some(json!("ended")));
        assert_eq!(status(&store, &second).await, Some(json!("calling")));
        assert_eq!(alice.devices.live_track_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_flow_after_transport_up() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _bob, _call_id) = connected_pair(&store, false).await;
        let peer = alice.peer();
        peer.set_path(ConnectionMode::Relayed);
        peer.emit(PeerEvent::StateChanged(PeerState::Connected));

        match alice.wait_for(|e| matches!(e, CallEvent::Stats(_))).await {
            CallEvent::Stats(stats) => assert_eq!(stats.path, ConnectionMode::Relayed),
            _ => unreachable!(),
        }
        // audio-only: only the audio sender is tuned
        let encodings = peer.encodings();
        assert_eq!(encodings, vec![(TrackKind::Audio, QualityProfile::RELAYED.audio)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_values_derived_from_two_readings() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _bob, _call_id) = connected_pair(&store, false).await;
        let peer = alice.peer();
        let t0 = std::time::Instant::now();
        let reading = |secs: u64, rtt: f64, received: u64, lost: i64, bytes_in: u64, bytes_out: u64, frames: u64| {
            RawStats {
                taken_at: t0 + Duration::from_secs(secs),
                round_trip_time: Some(rtt),
                packets_received: received,
                packets_lost: lost,
                bytes_received: bytes_in,
                bytes_sent: bytes_out,
                frames_received: Some(frames),
                path: ConnectionMode::Relayed,
            }
        };

        peer.set_path(ConnectionMode::Relayed);
        peer.set_stats(reading(0, 0.25, 95, 5, 0, 0, 0));
        peer.emit(PeerEvent::StateChanged(PeerState::Connected));

        let stats = |event: CallEvent| match event {
            CallEvent::Stats(stats) => stats,
            _ => unreachable!(),
        };
        let first = stats(alice.wait_for(|e| matches!(e, CallEvent::Stats(_))).await);
        assert_eq!(
            first,
            CallStats {
                rtt_ms: Some(250.0),
                packet_loss_pct: 5.0,
                framerate: None,
                inbound_kbps: 0.0,
                outbound_kbps: 0.0,
                path: ConnectionMode::Relayed,
            }
        );

        // two seconds later: 90 more received, 10 more lost
        peer.set_stats(reading(2, 0.125, 185, 15, 250_000, 125_000, 48));
        let second = stats(alice.wait_for(|e| matches!(e, CallEvent::Stats(_))).await);
        assert_eq!(
            second,
            CallStats {
                rtt_ms: Some(125.0),
                packet_loss_pct: 10.0,
                framerate: Some(24.0),
                inbound_kbps: 1000.0,
                outbound_kbps: 500.0,
                path: ConnectionMode::Relayed,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_controls() {
        let store = Arc::new(MemoryStore::new());
        let (alice, _bob, _call_id) = connected_pair(&store, true).await;
        let peer = alice.peer();

        assert!(alice.handle.toggle_mute().await.unwrap());
        assert!(!peer.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(!alice.handle.toggle_mute().await.unwrap());
        assert!(peer.track(TrackKind::Audio).unwrap().is_enabled());

        assert!(!alice.handle.toggle_video().await.unwrap());
        assert!(!peer.track(TrackKind::Video).unwrap().is_enabled());

        // single synthetic camera
        assert!(matches!(
            alice.handle.switch_camera().await,
            Err(CallError::NoAlternateCamera)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_controls_without_a_call() {
        let store = Arc::new(MemoryStore::new());
        let alice = Side::new(&store, "alice").await;
        assert!(matches!(
            alice.handle.toggle_mute().await,
            Err(CallError::InvalidState(_))
        ));
        assert!(matches!(
            alice.handle.start_screen_share().await,
            Err(CallError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_capture_ended_by_the_system_restores_camera() {
        let store = Arc::new(MemoryStore::new());
        let (alice, _bob, _call_id) = connected_pair(&store, true).await;
        let peer = alice.peer();

        alice.handle.start_screen_share().await.unwrap();
        let screen = peer.track(TrackKind::Video).unwrap();
        assert_eq!(screen.source(), TrackSource::Screen);

        screen.stop();
        settle().await;

        let video = peer.track(TrackKind::Video).unwrap();
        assert_eq!(video.source(), TrackSource::Camera);
        assert!(video.is_live());
    }
}
