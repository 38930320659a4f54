#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peercall::peer::{IceCandidate, IceState, PeerEventSink, PeerState, ServerConfig, SessionDescription};
use peercall::{
    CallCoordinator, CallConfig, CallError, CallEvent, CallSession, CallStatus, CaptureDevices,
    LocalTrack, MemoryStore, PartyInfo, PeerConnection, PeerConnector, PeerEvent,
};

/// Scripted peer connection: records what the coordinator asks of it and lets
/// the test inject connection events.
pub struct FakePeer {
    sink: PeerEventSink,
    label: String,
    local_candidates: Vec<String>,
    log: Mutex<Vec<String>>,
    remote_set: AtomicBool,
    applied: Mutex<Vec<String>>,
    video: Mutex<Option<Arc<LocalTrack>>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    restarts: AtomicUsize,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn emit(&self, event: PeerEvent) {
        (self.sink)(event);
    }

    /// Reports ICE and the aggregate state as connected.
    pub fn connect(&self) {
        self.emit(PeerEvent::IceState(IceState::Checking));
        self.emit(PeerEvent::IceState(IceState::Connected));
        self.emit(PeerEvent::ConnectionState(PeerState::Connected));
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Remote candidates applied, in application order.
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    pub fn local_candidates(&self) -> &[String] {
        &self.local_candidates
    }

    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        self.video.lock().unwrap().clone()
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        if track.kind() == peercall::TrackKind::Video {
            *self.video.lock().unwrap() = Some(track.clone());
        }
        self.push(format!("track {:?}", track.kind()));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        if ice_restart {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        } else {
            self.offers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.push(format!("local {:?}", desc.kind));
        // gathering starts once the local description is in place
        for candidate in &self.local_candidates {
            self.emit(PeerEvent::LocalCandidate(IceCandidate::new(candidate.clone())));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        self.push(format!("remote {:?}", desc.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(CallError::Peer("remote description not set".into()));
        }
        self.push(format!("candidate {}", candidate.candidate));
        self.applied.lock().unwrap().push(candidate.candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        self.push(format!("replace video {}", track.id()));
        *self.video.lock().unwrap() = Some(track);
        Ok(())
    }

    async fn log_selected_pair(&self, _moment: &str) {}

    async fn close(&self) -> Result<(), CallError> {
        self.closed.store(true, Ordering::SeqCst);
        self.push("close".into());
        Ok(())
    }
}

pub struct FakeConnector {
    label: String,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeConnector {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer connection was opened")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _ice_servers: &[ServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let n = self.count();
        let peer = Arc::new(FakePeer {
            sink: events,
            label: self.label.clone(),
            local_candidates: vec![
                format!("candidate:{}{n}1 1 udp 2130706431 10.0.0.1 5000{n} typ host", self.label),
                format!(
                    "candidate:{}{n}2 1 udp 1694498815 203.0.113.9 6000{n} typ srflx raddr 10.0.0.1 rport 5000{n}",
                    self.label
                ),
            ],
            log: Mutex::new(Vec::new()),
            remote_set: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
            video: Mutex::new(None),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

pub struct Party {
    pub info: PartyInfo,
    pub coordinator: CallCoordinator,
    pub devices: Arc<CaptureDevices>,
    pub connector: Arc<FakeConnector>,
}

impl Party {
    pub fn session(&self) -> CallSession {
        self.coordinator.session()
    }

    pub fn peer(&self) -> Arc<FakePeer> {
        self.connector.last()
    }
}

pub async fn party(store: &MemoryStore, id: &str, name: &str, config: CallConfig) -> Party {
    let devices = Arc::new(CaptureDevices::phone());
    let connector = FakeConnector::new(id);
    let coordinator = CallCoordinator::start(
        PartyInfo::new(id, name),
        config,
        devices.clone(),
        Arc::new(store.clone()),
        connector.clone(),
    )
    .await
    .expect("coordinator starts");
    Party {
        info: PartyInfo::new(id, name),
        coordinator,
        devices,
        connector,
    }
}

pub async fn pair(config: CallConfig) -> (MemoryStore, Party, Party) {
    let store = MemoryStore::new();
    let alice = party(&store, "alice", "Alice", config.clone()).await;
    let bob = party(&store, "bob", "Bob", config).await;
    (store, alice, bob)
}

/// Waits until the session satisfies `done`.
pub async fn wait_until(party: &Party, done: impl Fn(&CallSession) -> bool) {
    let mut rx = party.coordinator.watch();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| done(s)))
        .await
        .expect("session did not reach the expected state in time")
        .expect("coordinator dropped");
}

pub async fn wait_status(party: &Party, status: CallStatus) {
    wait_until(party, |s| s.status == status).await;
}

/// Lets spawned tasks run until `done` holds.
pub async fn settle(done: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    assert!(done(), "condition not reached");
}

/// Gives every spawned task a chance to run.
pub async fn run_pending() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Alice calls Bob and Bob answers. Returns the call id.
pub async fn connected_call(alice: &Party, bob: &Party, kind: peercall::MediaKind) -> String {
    let call_id = alice
        .coordinator
        .initiate_call(bob.info.clone(), kind)
        .await
        .expect("call starts");
    wait_status(bob, CallStatus::Ringing).await;
    bob.coordinator.answer_call().await.expect("answer succeeds");
    wait_status(alice, CallStatus::Connected).await;
    call_id
}
