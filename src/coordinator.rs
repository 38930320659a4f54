//! Call state machine for one local party.
//!
//! Commands (`initiate_call`, `answer_call`, ...) and store/peer notifications
//! are serialised by one operation lock. Notifications never run on the
//! callback that produced them: they are tagged with their call id and queued
//! for a driver task, which drops them once that call is gone. Remote
//! candidates skip the operation lock so they can race the descriptions.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::errors::CallError;
use crate::media::{MediaDevices, MediaManager, MediaStream};
use crate::peer::connection::{PeerConnector, PeerEvent, PeerEventSink};
use crate::peer::monitor::{ConnectionMonitor, MonitorAction, MonitorUpdate};
use crate::peer::session::PeerSession;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{
    CallEvent, CallRole, CallSession, CallStatus, Connectivity, EndReason, FacingMode, MediaKind,
    PartyInfo, RecordStatus,
};
use crate::signaling::{CallRecord, IncomingCall, SignalingChannel, SignalingStore, Subscription};
use crate::utils::{now_millis, random_id};

const EVENT_CAPACITY: usize = 64;
const TICK: Duration = Duration::from_secs(1);

enum Signal {
    Incoming(IncomingCall),
    Record(String, Option<CallRecord>),
    Answer(String, SessionDescription),
    RemoteCandidate(String, IceCandidate),
    Peer(String, PeerEvent),
    RingTimeout(String),
    GraceExpired(String, u64),
    Tick(String),
}

/// Resources owned by the call in progress; all of them are released by cleanup.
struct ActiveCall {
    call_id: String,
    role: CallRole,
    /// Id of the other party.
    peer_id: String,
    peer: Option<Arc<PeerSession>>,
    stream: Option<MediaStream>,
    subscriptions: Vec<Subscription>,
    ring_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
    duration_timer: Option<JoinHandle<()>>,
    monitor: ConnectionMonitor,
    record_created: bool,
    answer_applied: bool,
}

impl ActiveCall {
    fn new(call_id: &str, role: CallRole, peer_id: &str) -> Self {
        Self {
            call_id: call_id.to_owned(),
            role,
            peer_id: peer_id.to_owned(),
            peer: None,
            stream: None,
            subscriptions: Vec::new(),
            ring_timer: None,
            grace_timer: None,
            duration_timer: None,
            monitor: ConnectionMonitor::new(),
            record_created: false,
            answer_applied: false,
        }
    }

    fn abort_timers(&mut self) {
        for timer in [
            self.ring_timer.take(),
            self.grace_timer.take(),
            self.duration_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    active: Option<ActiveCall>,
    inbound: Option<Subscription>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    local: PartyInfo,
    config: CallConfig,
    media: MediaManager,
    signaling: SignalingChannel,
    connector: Arc<dyn PeerConnector>,
    op_lock: AsyncMutex<()>,
    state: Mutex<CoordinatorState>,
    session_tx: watch::Sender<CallSession>,
    events_tx: broadcast::Sender<CallEvent>,
    signals: mpsc::UnboundedSender<Signal>,
}

/// Negotiates and runs the calls of one local party.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<Inner>,
}

impl CallCoordinator {
    /// Starts watching the local party's inbound-call path.
    pub async fn start(
        local: PartyInfo,
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        store: Arc<dyn SignalingStore>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let (signals, rx) = mpsc::unbounded_channel();
        let (session_tx, _) = watch::channel(CallSession::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            media: MediaManager::new(devices, &config),
            signaling: SignalingChannel::new(store),
            local,
            config,
            connector,
            op_lock: AsyncMutex::new(()),
            state: Mutex::new(CoordinatorState::default()),
            session_tx,
            events_tx,
            signals,
        });
        let driver = tokio::spawn(drive(Arc::downgrade(&inner), rx));
        inner.state().driver = Some(driver);

        let tx = inner.signals.clone();
        let party = inner.local.id.clone();
        let inbound = inner
            .signaling
            .watch_incoming(&inner.local.id, move |incoming| match incoming {
                Ok(Some(incoming)) => {
                    let _ = tx.send(Signal::Incoming(incoming));
                }
                Ok(None) => {}
                Err(e) => warn!(party = %party, error = %e, "skipping malformed inbound call"),
            })
            .await?;
        inner.state().inbound = Some(inbound);

        info!(party = %inner.local.id, "call coordinator started");
        Ok(Self { inner })
    }

    pub fn local(&self) -> &PartyInfo {
        &self.inner.local
    }

    pub fn config(&self) -> &CallConfig {
        &self.inner.config
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.inner.signaling
    }

    /// Current snapshot of the call session.
    pub fn session(&self) -> CallSession {
        self.inner.session()
    }

    pub fn watch(&self) -> watch::Receiver<CallSession> {
        self.inner.session_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events_tx.subscribe()
    }

    /// `idle → calling`. Returns the new call id.
    pub async fn initiate_call(
        &self,
        receiver: PartyInfo,
        kind: MediaKind,
    ) -> Result<String, CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let status = inner.status();
        if status != CallStatus::Idle {
            return Err(CallError::Busy(status));
        }

        let call_id = random_id();
        info!(call_id, receiver = %receiver.id, ?kind, "initiating call");
        inner.state().active = Some(ActiveCall::new(&call_id, CallRole::Caller, &receiver.id));
        inner.session_tx.send_replace(CallSession {
            call_id: Some(call_id.clone()),
            role: Some(CallRole::Caller),
            caller: inner.local.clone(),
            receiver: receiver.clone(),
            kind,
            status: CallStatus::Calling,
            ..CallSession::idle()
        });
        inner.emit_status(&call_id, CallStatus::Calling);

        match inner.setup_outgoing(&call_id, &receiver, kind).await {
            Ok(()) => Ok(call_id),
            Err(e) => {
                error!(call_id, error = %e, "outgoing call setup failed");
                let record_created = inner
                    .with_call(&call_id, |c| c.record_created)
                    .unwrap_or(false);
                if record_created {
                    inner.write_status(&call_id, RecordStatus::Ended).await;
                    inner.clear_incoming(&receiver.id, &call_id).await;
                }
                inner
                    .cleanup(&call_id, EndReason::SetupFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// `ringing → connected`. A no-op unless ringing.
    ///
    /// When the local devices cannot be opened the call keeps ringing.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        if inner.status() != CallStatus::Ringing {
            debug!("answer ignored, not ringing");
            return Ok(());
        }
        let Some((call_id, caller_id)) = inner.current(|c| (c.call_id.clone(), c.peer_id.clone()))
        else {
            return Ok(());
        };

        let stream = inner.media.acquire(inner.session().kind, Some(FacingMode::User)).await?;
        match inner.setup_answer(&call_id, &caller_id, stream).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(call_id, error = %e, "answering failed");
                inner.write_status(&call_id, RecordStatus::Ended).await;
                inner.clear_incoming(&inner.local.id, &call_id).await;
                inner
                    .cleanup(&call_id, EndReason::SetupFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// `ringing → idle`. A no-op unless ringing.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        if inner.status() != CallStatus::Ringing {
            debug!("reject ignored, not ringing");
            return Ok(());
        }
        let Some(call_id) = inner.current_call_id() else {
            return Ok(());
        };

        info!(call_id, "rejecting call");
        let written = inner
            .signaling
            .set_status(&call_id, RecordStatus::Rejected, now_millis())
            .await;
        inner.clear_incoming(&inner.local.id, &call_id).await;
        inner.cleanup(&call_id, EndReason::RejectedLocally).await;
        written
    }

    /// `calling | connected → idle`. A no-op otherwise.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let status = inner.status();
        if !matches!(status, CallStatus::Calling | CallStatus::Connected) {
            debug!(?status, "end ignored, no call in progress");
            return Ok(());
        }
        let Some((call_id, role, peer_id)) =
            inner.current(|c| (c.call_id.clone(), c.role, c.peer_id.clone()))
        else {
            return Ok(());
        };

        info!(call_id, "ending call");
        let written = inner
            .signaling
            .set_status(&call_id, RecordStatus::Ended, now_millis())
            .await;
        if role == CallRole::Caller && status == CallStatus::Calling {
            inner.clear_incoming(&peer_id, &call_id).await;
        }
        inner.cleanup(&call_id, EndReason::LocalHangup).await;
        written
    }

    /// Flips the microphone. Returns whether it is now muted.
    pub fn toggle_mute(&self) -> bool {
        let inner = &self.inner;
        let track = inner
            .current(|c| c.stream.as_ref().and_then(|s| s.audio_track().cloned()))
            .flatten();
        let Some(track) = track else {
            return inner.session().muted;
        };
        let muted = track.is_enabled();
        track.set_enabled(!muted);
        inner.session_tx.send_modify(|s| s.muted = muted);
        debug!(muted, "microphone toggled");
        muted
    }

    /// Flips the camera. Returns whether it is now off.
    pub fn toggle_video(&self) -> bool {
        let inner = &self.inner;
        let track = inner
            .current(|c| c.stream.as_ref().and_then(|s| s.video_track().cloned()))
            .flatten();
        let Some(track) = track else {
            return inner.session().camera_off;
        };
        let off = track.is_enabled();
        track.set_enabled(!off);
        inner.session_tx.send_modify(|s| s.camera_off = off);
        debug!(camera_off = off, "camera toggled");
        off
    }

    /// Swaps front and back camera on an active video call without renegotiating.
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let session = inner.session();
        if session.kind != MediaKind::Video
            || !matches!(session.status, CallStatus::Calling | CallStatus::Connected)
        {
            debug!("camera switch ignored, no active video call");
            return Ok(());
        }
        let Some((call_id, Some(stream), peer)) =
            inner.current(|c| (c.call_id.clone(), c.stream.clone(), c.peer.clone()))
        else {
            return Ok(());
        };

        let switched = inner.media.switch_camera(&stream, session.facing).await?;
        let Some(video) = switched.video_track().cloned() else {
            return Ok(());
        };
        let facing = video.facing().unwrap_or(session.facing.opposite());
        inner.with_call(&call_id, |c| c.stream = Some(switched.clone()));
        inner.session_tx.send_modify(|s| {
            s.local_stream = Some(switched);
            s.facing = facing;
        });
        if let Some(peer) = peer {
            peer.replace_outbound_video_track(video).await?;
        }
        info!(call_id, ?facing, "camera switched");
        Ok(())
    }

    /// Releases the current call locally without writing to the store.
    ///
    /// Returns `false` when there was nothing to release.
    pub async fn cleanup(&self) -> bool {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        match inner.current_call_id() {
            Some(call_id) => inner.cleanup(&call_id, EndReason::Aborted).await,
            None => false,
        }
    }

    /// Ends any call in progress and stops watching for inbound calls.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let inbound = inner.state().inbound.take();
        drop(inbound);

        if let Some((call_id, role, peer_id)) =
            inner.current(|c| (c.call_id.clone(), c.role, c.peer_id.clone()))
        {
            let status = inner.status();
            if matches!(status, CallStatus::Calling | CallStatus::Connected) {
                inner.write_status(&call_id, RecordStatus::Ended).await;
                if role == CallRole::Caller && status == CallStatus::Calling {
                    inner.clear_incoming(&peer_id, &call_id).await;
                }
            }
            inner.cleanup(&call_id, EndReason::Shutdown).await;
        }
        info!(party = %inner.local.id, "call coordinator shut down");
    }
}

async fn drive(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(signal).await;
    }
}

/// How a closed record ends the local call; `None` while the call is open.
fn end_reason(record: Option<&CallRecord>) -> Option<EndReason> {
    match record.map(|r| r.status) {
        None => Some(EndReason::RecordRemoved),
        Some(RecordStatus::Ended) => Some(EndReason::RemoteHangup),
        Some(RecordStatus::Rejected) => Some(EndReason::RejectedByPeer),
        Some(RecordStatus::Missed) => Some(EndReason::Missed),
        Some(RecordStatus::Pending | RecordStatus::Accepted) => None,
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> CallSession {
        self.session_tx.borrow().clone()
    }

    fn status(&self) -> CallStatus {
        self.session_tx.borrow().status
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_status(&self, call_id: &str, status: CallStatus) {
        self.emit(CallEvent::StatusChanged {
            call_id: call_id.to_owned(),
            status,
        });
    }

    fn set_status(&self, call_id: &str, status: CallStatus) {
        self.session_tx.send_modify(|s| s.status = status);
        self.emit_status(call_id, status);
    }

    /// Runs `f` on the active call when it is still `call_id`.
    fn with_call<R>(&self, call_id: &str, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        let mut state = self.state();
        match state.active.as_mut() {
            Some(call) if call.call_id == call_id => Some(f(call)),
            _ => None,
        }
    }

    fn current<R>(&self, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        self.state().active.as_mut().map(f)
    }

    fn current_call_id(&self) -> Option<String> {
        self.current(|c| c.call_id.clone())
    }

    fn peer_of(&self, call_id: &str) -> Option<Arc<PeerSession>> {
        self.with_call(call_id, |c| c.peer.clone()).flatten()
    }

    fn keep_subscription(&self, call_id: &str, sub: Subscription) {
        // a call already gone drops the handle, which unsubscribes
        let _ = self.with_call(call_id, move |c| c.subscriptions.push(sub));
    }

    fn after(&self, delay: Duration, signal: Signal) -> JoinHandle<()> {
        let tx = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(signal);
        })
    }

    fn start_ring_timer(&self, call_id: &str, delay: Duration) {
        let timer = self.after(delay, Signal::RingTimeout(call_id.to_owned()));
        let previous = self.with_call(call_id, |c| c.ring_timer.replace(timer));
        if let Some(Some(previous)) = previous {
            previous.abort();
        }
    }

    fn start_grace(&self, call_id: &str, generation: u64) {
        info!(call_id, generation, grace = ?self.config.disconnect_grace(), "grace period started");
        let timer = self.after(
            self.config.disconnect_grace(),
            Signal::GraceExpired(call_id.to_owned(), generation),
        );
        let previous = self.with_call(call_id, |c| c.grace_timer.replace(timer));
        if let Some(Some(previous)) = previous {
            previous.abort();
        }
    }

    /// Starts the 1 Hz duration counter once media flows on a `connected` call.
    fn start_duration(&self, call_id: &str) {
        if self.status() != CallStatus::Connected {
            return;
        }
        let started = self.with_call(call_id, |c| {
            if let Some(grace) = c.grace_timer.take() {
                grace.abort();
            }
            if c.duration_timer.is_some() || c.monitor.connectivity() != Connectivity::Connected {
                return false;
            }
            let tx = self.signals.clone();
            let id = c.call_id.clone();
            c.duration_timer = Some(tokio::spawn(async move {
                let mut ticks = tokio::time::interval_at(Instant::now() + TICK, TICK);
                loop {
                    ticks.tick().await;
                    if tx.send(Signal::Tick(id.clone())).is_err() {
                        break;
                    }
                }
            }));
            true
        });
        if started == Some(true) {
            self.session_tx.send_modify(|s| s.duration_secs = 0);
            if let Some(peer) = self.peer_of(call_id) {
                peer.local_candidate_summary();
            }
            info!(call_id, "media connected, duration counter started");
        }
    }

    fn event_sink(&self, call_id: &str) -> PeerEventSink {
        let tx = self.signals.clone();
        let id = call_id.to_owned();
        Arc::new(move |event| {
            let _ = tx.send(Signal::Peer(id.clone(), event));
        })
    }

    async fn open_peer(&self, call_id: &str) -> Result<Arc<PeerSession>, CallError> {
        let peer = Arc::new(
            PeerSession::create(
                self.connector.as_ref(),
                &self.config.ice_servers,
                self.event_sink(call_id),
            )
            .await?,
        );
        self.with_call(call_id, |c| c.peer = Some(peer.clone()));
        Ok(peer)
    }

    fn adopt_stream(&self, call_id: &str, stream: &MediaStream) {
        self.with_call(call_id, |c| c.stream = Some(stream.clone()));
        let local = stream.clone();
        self.session_tx.send_modify(|s| {
            s.local_stream = Some(local);
            s.facing = FacingMode::User;
            s.muted = false;
            s.camera_off = false;
        });
    }

    async fn watch_record(&self, call_id: &str) -> Result<(), CallError> {
        let tx = self.signals.clone();
        let id = call_id.to_owned();
        let sub = self
            .signaling
            .watch_record(call_id, move |record| match record {
                Ok(record) => {
                    let _ = tx.send(Signal::Record(id.clone(), record));
                }
                Err(e) => warn!(call_id = %id, error = %e, "skipping malformed call record"),
            })
            .await?;
        self.keep_subscription(call_id, sub);
        Ok(())
    }

    async fn watch_remote_candidates(&self, call_id: &str, party_id: &str) -> Result<(), CallError> {
        let tx = self.signals.clone();
        let id = call_id.to_owned();
        let sub = self
            .signaling
            .watch_candidates(call_id, party_id, move |candidate| match candidate {
                Ok(candidate) => {
                    let _ = tx.send(Signal::RemoteCandidate(id.clone(), candidate));
                }
                Err(e) => warn!(call_id = %id, error = %e, "skipping malformed remote candidate"),
            })
            .await?;
        self.keep_subscription(call_id, sub);
        Ok(())
    }

    async fn setup_outgoing(
        &self,
        call_id: &str,
        receiver: &PartyInfo,
        kind: MediaKind,
    ) -> Result<(), CallError> {
        let stream = self.media.acquire(kind, Some(FacingMode::User)).await?;
        self.adopt_stream(call_id, &stream);

        let peer = self.open_peer(call_id).await?;
        peer.attach_local_tracks(&stream).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(&offer).await?;

        let record = CallRecord {
            caller_id: self.local.id.clone(),
            caller_name: self.local.name.clone(),
            caller_photo: self.local.photo.clone(),
            receiver_id: receiver.id.clone(),
            receiver_name: receiver.name.clone(),
            kind,
            status: RecordStatus::Pending,
            created_at: now_millis(),
            answered_at: None,
            ended_at: None,
        };
        self.signaling.create_call(call_id, &record, &offer).await?;
        self.with_call(call_id, |c| c.record_created = true);
        self.session_tx.send_modify(|s| {
            s.created_at = Some(record.created_at);
            s.record_status = Some(RecordStatus::Pending);
        });

        self.watch_record(call_id).await?;
        let tx = self.signals.clone();
        let id = call_id.to_owned();
        let answer_sub = self
            .signaling
            .watch_answer(call_id, move |answer| match answer {
                Ok(answer) => {
                    let _ = tx.send(Signal::Answer(id.clone(), answer));
                }
                Err(e) => warn!(call_id = %id, error = %e, "skipping malformed answer"),
            })
            .await?;
        self.keep_subscription(call_id, answer_sub);
        self.watch_remote_candidates(call_id, &receiver.id).await?;

        self.signaling
            .ring(&receiver.id, &IncomingCall::for_record(call_id, &record))
            .await?;
        self.start_ring_timer(call_id, self.config.ring_timeout());
        info!(call_id, "offer published, waiting for answer");
        Ok(())
    }

    async fn setup_answer(
        &self,
        call_id: &str,
        caller_id: &str,
        stream: MediaStream,
    ) -> Result<(), CallError> {
        if let Some(Some(ring)) = self.with_call(call_id, |c| c.ring_timer.take()) {
            ring.abort();
        }
        self.adopt_stream(call_id, &stream);

        let peer = self.open_peer(call_id).await?;
        peer.attach_local_tracks(&stream).await?;
        self.watch_remote_candidates(call_id, caller_id).await?;

        let offer = self.signaling.read_offer(call_id).await?;
        let flushed = peer.set_remote_description(&offer).await?;
        debug!(call_id, flushed, "offer applied");
        let answer = peer.create_answer().await?;
        peer.set_local_description(&answer).await?;
        if self.closed_while_answering(call_id).await? {
            return Ok(());
        }
        self.signaling.publish_answer(call_id, &answer).await?;
        if self.closed_while_answering(call_id).await? {
            return Ok(());
        }

        let answered_at = now_millis();
        self.signaling
            .set_status(call_id, RecordStatus::Accepted, answered_at)
            .await?;
        self.clear_incoming(&self.local.id, call_id).await;

        self.session_tx.send_modify(|s| {
            s.answered_at = Some(answered_at);
            s.record_status = Some(RecordStatus::Accepted);
        });
        self.set_status(call_id, CallStatus::Connected);
        self.start_duration(call_id);
        info!(call_id, "call answered");
        Ok(())
    }

    /// Re-reads the record before the callee writes to it. A record the caller
    /// already closed or removed ends the call locally without any write to
    /// the record.
    async fn closed_while_answering(&self, call_id: &str) -> Result<bool, CallError> {
        let record = self.signaling.read_record(call_id).await?;
        let Some(reason) = end_reason(record.as_ref()) else {
            return Ok(false);
        };
        info!(call_id, ?reason, "call closed while answering");
        self.clear_incoming(&self.local.id, call_id).await;
        self.cleanup(call_id, reason).await;
        if record.is_some() {
            self.purge_record(call_id).await;
        }
        Ok(true)
    }

    async fn purge_record(&self, call_id: &str) {
        if !self.config.purge_finished_records {
            return;
        }
        match self.signaling.remove_call(call_id).await {
            Ok(()) => debug!(call_id, "finished call record purged"),
            Err(e) => warn!(call_id, error = %e, "could not purge call record"),
        }
    }

    /// Best-effort status write on paths that end the call anyway.
    async fn write_status(&self, call_id: &str, status: RecordStatus) {
        if let Err(e) = self.signaling.set_status(call_id, status, now_millis()).await {
            warn!(call_id, ?status, error = %e, "could not write record status");
        }
    }

    async fn clear_incoming(&self, party_id: &str, call_id: &str) {
        if let Err(e) = self.signaling.clear_incoming(party_id, call_id).await {
            warn!(party_id, call_id, error = %e, "could not clear inbound pointer");
        }
    }

    /// Single release point of a call. Safe to call again once the call is gone.
    async fn cleanup(&self, call_id: &str, reason: EndReason) -> bool {
        let taken = {
            let mut state = self.state();
            match state.active.as_ref() {
                Some(call) if call.call_id == call_id => state.active.take(),
                _ => None,
            }
        };
        let Some(mut call) = taken else {
            return false;
        };

        // unsubscribe first so nothing new is queued for this call
        for sub in call.subscriptions.drain(..) {
            sub.cancel();
        }
        call.abort_timers();
        let released = call.stream.as_ref().map_or(0, |s| self.media.release(s));
        if let Some(peer) = call.peer.take() {
            peer.close().await;
        }

        let ended_at = now_millis();
        self.session_tx.send_modify(|s| {
            s.status = CallStatus::Ended;
            s.ended_at.get_or_insert(ended_at);
            s.local_stream = None;
        });
        self.emit_status(call_id, CallStatus::Ended);
        info!(call_id, ?reason, released, "call cleaned up");
        self.emit(CallEvent::Ended {
            call_id: call_id.to_owned(),
            reason,
        });
        self.session_tx.send_replace(CallSession::idle());
        self.emit_status(call_id, CallStatus::Idle);
        true
    }

    /// Ends the call from a connectivity failure, telling the other party.
    async fn terminate(&self, call_id: &str, reason: EndReason) {
        let _op = self.op_lock.lock().await;
        if self.with_call(call_id, |_| ()).is_none() {
            return;
        }
        warn!(call_id, ?reason, "terminating call");
        self.write_status(call_id, RecordStatus::Ended).await;
        self.cleanup(call_id, reason).await;
    }

    async fn handle(&self, signal: Signal) {
        match signal {
            Signal::Incoming(incoming) => self.on_incoming(incoming).await,
            Signal::Record(call_id, record) => self.on_record(&call_id, record).await,
            Signal::Answer(call_id, answer) => self.on_answer(&call_id, answer).await,
            Signal::RemoteCandidate(call_id, candidate) => {
                self.on_remote_candidate(&call_id, candidate).await
            }
            Signal::Peer(call_id, event) => self.on_peer_event(&call_id, event).await,
            Signal::RingTimeout(call_id) => self.on_ring_timeout(&call_id).await,
            Signal::GraceExpired(call_id, generation) => {
                self.apply_monitor(&call_id, |m| m.grace_expired(generation))
                    .await
            }
            Signal::Tick(call_id) => {
                if self.with_call(&call_id, |_| ()).is_some()
                    && self.status() == CallStatus::Connected
                {
                    self.session_tx.send_modify(|s| s.duration_secs += 1);
                }
            }
        }
    }

    async fn on_incoming(&self, incoming: IncomingCall) {
        let _op = self.op_lock.lock().await;
        let call_id = incoming.call_id.clone();
        let status = self.status();
        if status != CallStatus::Idle {
            info!(call_id, ?status, "busy, ignoring inbound call");
            return;
        }
        let Some(ring_left) = self.ring_time_left(incoming.created_at) else {
            debug!(call_id, created_at = incoming.created_at, "ignoring stale inbound call");
            return;
        };
        let record = match self.signaling.read_record(&call_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(call_id, "inbound call has no record");
                return;
            }
            Err(e) => {
                warn!(call_id, error = %e, "could not read inbound call record");
                return;
            }
        };
        if record.status != RecordStatus::Pending || record.receiver_id != self.local.id {
            debug!(call_id, status = ?record.status, "ignoring inbound call that is no longer pending");
            return;
        }

        info!(call_id, caller = %record.caller_id, kind = ?record.kind, "incoming call");
        self.state().active = Some(ActiveCall::new(&call_id, CallRole::Callee, &record.caller_id));
        self.session_tx.send_replace(CallSession {
            call_id: Some(call_id.clone()),
            role: Some(CallRole::Callee),
            caller: PartyInfo {
                id: record.caller_id.clone(),
                name: record.caller_name.clone(),
                photo: record.caller_photo.clone(),
            },
            receiver: self.local.clone(),
            kind: record.kind,
            status: CallStatus::Ringing,
            record_status: Some(record.status),
            created_at: Some(record.created_at),
            ..CallSession::idle()
        });
        self.emit_status(&call_id, CallStatus::Ringing);

        if let Err(e) = self.watch_record(&call_id).await {
            warn!(call_id, error = %e, "could not watch inbound call record");
            self.cleanup(&call_id, EndReason::SetupFailed(e.to_string()))
                .await;
            return;
        }
        debug!(call_id, ?ring_left, "ring window armed");
        self.start_ring_timer(&call_id, ring_left);
    }

    /// Part of the ring window still open for a call created at `created_at`,
    /// or `None` once it has passed. A timestamp ahead of the local clock gets
    /// the full window.
    fn ring_time_left(&self, created_at: i64) -> Option<Duration> {
        let window = self.config.ring_timeout();
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = now_millis().saturating_sub(created_at).max(0);
        if elapsed_ms > window_ms {
            return None;
        }
        let elapsed = Duration::from_millis(u64::try_from(elapsed_ms).unwrap_or(u64::MAX));
        Some(window.saturating_sub(elapsed))
    }

    async fn on_record(&self, call_id: &str, record: Option<CallRecord>) {
        let _op = self.op_lock.lock().await;
        let Some(role) = self.with_call(call_id, |c| c.role) else {
            return;
        };
        let Some(record) = record else {
            info!(call_id, "call record removed");
            self.cleanup(call_id, EndReason::RecordRemoved).await;
            return;
        };

        self.session_tx.send_modify(|s| {
            s.record_status = Some(record.status);
            s.answered_at = record.answered_at.or(s.answered_at);
            s.ended_at = record.ended_at.or(s.ended_at);
        });
        let Some(reason) = end_reason(Some(&record)) else {
            return;
        };

        // own terminal writes are followed by cleanup, so this one is remote
        info!(call_id, status = ?record.status, "call closed by the other party");
        if role == CallRole::Callee {
            self.clear_incoming(&self.local.id, call_id).await;
        }
        self.cleanup(call_id, reason).await;
        self.purge_record(call_id).await;
    }

    async fn on_answer(&self, call_id: &str, answer: SessionDescription) {
        let _op = self.op_lock.lock().await;
        let Some((role, applied, peer)) =
            self.with_call(call_id, |c| (c.role, c.answer_applied, c.peer.clone()))
        else {
            return;
        };
        if role != CallRole::Caller || applied || self.status() != CallStatus::Calling {
            return;
        }
        let Some(peer) = peer else {
            return;
        };

        match peer.set_remote_description(&answer).await {
            Ok(flushed) => debug!(call_id, flushed, "answer applied"),
            Err(e) => {
                warn!(call_id, error = %e, "skipping unusable answer");
                return;
            }
        }
        self.with_call(call_id, |c| {
            c.answer_applied = true;
            if let Some(ring) = c.ring_timer.take() {
                ring.abort();
            }
        });
        self.set_status(call_id, CallStatus::Connected);
        self.start_duration(call_id);
        info!(call_id, "call accepted by the other party");
    }

    async fn on_remote_candidate(&self, call_id: &str, candidate: IceCandidate) {
        let Some(peer) = self.peer_of(call_id) else {
            debug!(call_id, "dropping candidate for inactive call");
            return;
        };
        let disposition = peer.add_remote_candidate(candidate).await;
        debug!(call_id, ?disposition, "remote candidate");
    }

    async fn on_peer_event(&self, call_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(peer) = self.peer_of(call_id) else {
                    return;
                };
                peer.record_local_candidate(candidate.clone());
                if let Err(e) = self
                    .signaling
                    .append_candidate(call_id, &self.local.id, &candidate)
                    .await
                {
                    warn!(call_id, error = %e, "could not publish local candidate");
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if self.with_call(call_id, |_| ()).is_none() {
                    return;
                }
                let added = track.clone();
                self.session_tx.send_modify(|s| s.remote_tracks.push(added));
                self.emit(CallEvent::RemoteTrackAdded {
                    call_id: call_id.to_owned(),
                    track,
                });
            }
            PeerEvent::ConnectionState(state) => {
                self.apply_monitor(call_id, |m| m.on_peer_state(state)).await
            }
            PeerEvent::IceState(state) => {
                self.apply_monitor(call_id, |m| m.on_ice_state(state)).await
            }
        }
    }

    async fn apply_monitor(
        &self,
        call_id: &str,
        observe: impl FnOnce(&mut ConnectionMonitor) -> MonitorUpdate,
    ) {
        let Some(update) = self.with_call(call_id, |c| observe(&mut c.monitor)) else {
            return;
        };
        if let Some(connectivity) = update.connectivity {
            self.session_tx.send_modify(|s| s.connectivity = connectivity);
            self.emit(CallEvent::ConnectivityChanged {
                call_id: call_id.to_owned(),
                state: connectivity,
            });
        }
        match update.action {
            MonitorAction::None => {}
            MonitorAction::Connected => self.start_duration(call_id),
            MonitorAction::StartGrace(generation) => self.start_grace(call_id, generation),
            MonitorAction::RestartIce(generation) => {
                self.start_grace(call_id, generation);
                if let Some(peer) = self.peer_of(call_id) {
                    peer.log_selected_pair("ICE-RESTART").await;
                    if let Err(e) = peer.restart_ice().await {
                        warn!(call_id, error = %e, "ICE restart failed");
                    }
                }
            }
            MonitorAction::Terminate => self.terminate(call_id, EndReason::ConnectionFailed).await,
        }
    }

    async fn on_ring_timeout(&self, call_id: &str) {
        let _op = self.op_lock.lock().await;
        let Some((role, peer_id)) = self.with_call(call_id, |c| (c.role, c.peer_id.clone())) else {
            return;
        };
        match (role, self.status()) {
            (CallRole::Caller, CallStatus::Calling) => {
                info!(call_id, "no answer, call missed");
                self.write_status(call_id, RecordStatus::Missed).await;
                self.clear_incoming(&peer_id, call_id).await;
                self.cleanup(call_id, EndReason::Missed).await;
            }
            (CallRole::Callee, CallStatus::Ringing) => {
                info!(call_id, "stopped ringing");
                self.cleanup(call_id, EndReason::Missed).await;
            }
            _ => {}
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.inbound.take();
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        if let Some(mut call) = state.active.take() {
            call.subscriptions.clear();
            call.abort_timers();
            if let Some(stream) = &call.stream {
                self.media.release(stream);
            }
            if let (Some(peer), Ok(runtime)) = (call.peer.take(), Handle::try_current()) {
                runtime.spawn(async move {
                    peer.close().await;
                });
            }
        }
    }
}
