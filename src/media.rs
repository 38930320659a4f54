use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::{AudioConstraints, CallConfig, VideoConstraints};
use crate::errors::{CallError, MediaAccessError};
use crate::session::{FacingMode, MediaKind};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local capture track.
///
/// The host capture loop pushes encoded frames through [`LocalTrack::write_sample`];
/// the peer connection sends whatever reaches the underlying sample track.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    facing: Option<FacingMode>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, facing: Option<FacingMode>, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), random_id());
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            facing,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops the track. Returns `true` only for the call that actually stopped it.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Forwards one encoded frame. Disabled tracks drop frames, stopped tracks refuse them.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), CallError> {
        if self.is_stopped() {
            return Err(CallError::Peer(format!("track {} is stopped", self.id)));
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("facing", &self.facing)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// A set of local tracks captured together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    audio: Vec<Arc<LocalTrack>>,
    video: Vec<Arc<LocalTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio: Vec::new(),
            video: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: Arc<LocalTrack>) -> Self {
        match track.kind() {
            TrackKind::Audio => self.audio.push(track),
            TrackKind::Video => self.video.push(track),
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_tracks(&self) -> &[Arc<LocalTrack>] {
        &self.audio
    }

    pub fn video_tracks(&self) -> &[Arc<LocalTrack>] {
        &self.video
    }

    pub fn audio_track(&self) -> Option<&Arc<LocalTrack>> {
        self.audio.first()
    }

    pub fn video_track(&self) -> Option<&Arc<LocalTrack>> {
        self.video.first()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Arc<LocalTrack>> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks().filter(|t| !t.is_stopped()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
}

/// What to open; `None` means the device kind is not requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoRequest>,
}

/// Consumed capture-device contract.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaAccessError>;
}

/// Device backend producing sample-fed tracks for the host capture loop.
///
/// It knows which devices exist and whether the user granted access; every
/// opened track stays reachable through [`CaptureDevices::live_tracks`] until
/// it is stopped, so the host knows where to write frames.
pub struct CaptureDevices {
    microphone: bool,
    cameras: Vec<FacingMode>,
    permission: AtomicBool,
    camera_busy: AtomicBool,
    opened: Mutex<Vec<Weak<LocalTrack>>>,
    acquisitions: AtomicUsize,
    last_constraints: Mutex<Option<MediaConstraints>>,
}

impl CaptureDevices {
    pub fn new(microphone: bool, cameras: Vec<FacingMode>) -> Self {
        Self {
            microphone,
            cameras,
            permission: AtomicBool::new(true),
            camera_busy: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
            acquisitions: AtomicUsize::new(0),
            last_constraints: Mutex::new(None),
        }
    }

    /// Phone-style device set: microphone plus front and back cameras.
    pub fn phone() -> Self {
        Self::new(true, vec![FacingMode::User, FacingMode::Environment])
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission.store(granted, Ordering::SeqCst);
    }

    /// Marks the cameras as held by another application.
    pub fn set_camera_busy(&self, busy: bool) {
        self.camera_busy.store(busy, Ordering::SeqCst);
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        self.last_constraints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn live_tracks(&self) -> Vec<Arc<LocalTrack>> {
        let mut opened = self.opened.lock().unwrap_or_else(|e| e.into_inner());
        opened.retain(|w| w.upgrade().is_some_and(|t| !t.is_stopped()));
        opened.iter().filter_map(Weak::upgrade).collect()
    }

    fn open(&self, track: LocalTrack) -> Arc<LocalTrack> {
        let track = Arc::new(track);
        self.opened
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&track));
        track
    }
}

#[async_trait]
impl MediaDevices for CaptureDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaAccessError> {
        *self
            .last_constraints
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(constraints.clone());

        if constraints.audio.is_some() && !self.microphone {
            return Err(MediaAccessError::DeviceNotFound("microphone".into()));
        }
        let camera = match &constraints.video {
            Some(request) => {
                // facing is an ideal, any camera satisfies the request
                let facing = if self.cameras.contains(&request.facing) {
                    request.facing
                } else {
                    *self
                        .cameras
                        .first()
                        .ok_or_else(|| MediaAccessError::DeviceNotFound("camera".into()))?
                };
                Some(facing)
            }
            None => None,
        };
        if !self.permission.load(Ordering::SeqCst) {
            let device = if constraints.audio.is_some() { "microphone" } else { "camera" };
            return Err(MediaAccessError::PermissionDenied(device.into()));
        }
        if camera.is_some() && self.camera_busy.load(Ordering::SeqCst) {
            return Err(MediaAccessError::DeviceBusy("camera".into()));
        }

        let mut stream = MediaStream::new(format!("stream-{}", random_id()));
        if constraints.audio.is_some() {
            let track = self.open(LocalTrack::new(TrackKind::Audio, None, stream.id()));
            stream = stream.with_track(track);
        }
        if let Some(facing) = camera {
            let track = self.open(LocalTrack::new(TrackKind::Video, Some(facing), stream.id()));
            stream = stream.with_track(track);
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

/// Opens, releases and hot-swaps local capture devices for a call.
#[derive(Clone)]
pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
    audio: AudioConstraints,
    video: VideoConstraints,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>, config: &CallConfig) -> Self {
        Self {
            devices,
            audio: config.audio.clone(),
            video: config.video.clone(),
        }
    }

    fn video_request(&self, facing: FacingMode) -> VideoRequest {
        VideoRequest {
            facing,
            width: self.video.width,
            height: self.video.height,
        }
    }

    /// Microphone always, camera for video calls.
    pub async fn acquire(
        &self,
        kind: MediaKind,
        facing: Option<FacingMode>,
    ) -> Result<MediaStream, CallError> {
        let constraints = MediaConstraints {
            audio: Some(self.audio.clone()),
            video: match kind {
                MediaKind::Audio => None,
                MediaKind::Video => Some(self.video_request(facing.unwrap_or_default())),
            },
        };
        let stream = self.devices.acquire(&constraints).await?;
        tracing::info!(
            "acquired local stream {} ({} audio, {} video)",
            stream.id(),
            stream.audio_tracks().len(),
            stream.video_tracks().len()
        );
        Ok(stream)
    }

    /// Stops every track of `stream`; safe to call repeatedly.
    pub fn release(&self, stream: &MediaStream) -> usize {
        let stopped = stream.tracks().filter(|t| t.stop()).count();
        if stopped > 0 {
            tracing::info!("released {stopped} track(s) of stream {}", stream.id());
        }
        stopped
    }

    /// Opens the opposite camera and returns a stream holding the new video
    /// track next to the untouched audio track of `current`.
    pub async fn switch_camera(
        &self,
        current: &MediaStream,
        current_facing: FacingMode,
    ) -> Result<MediaStream, CallError> {
        let wanted = current_facing.opposite();
        let fresh = self
            .devices
            .acquire(&MediaConstraints {
                audio: None,
                video: Some(self.video_request(wanted)),
            })
            .await?;
        let video = fresh
            .video_track()
            .cloned()
            .ok_or_else(|| MediaAccessError::DeviceNotFound("camera".into()))?;

        let was_enabled = current.video_track().map_or(true, |t| t.is_enabled());
        video.set_enabled(was_enabled);
        for old in current.video_tracks() {
            old.stop();
        }

        let mut stream = MediaStream::new(current.id());
        for audio in current.audio_tracks() {
            stream = stream.with_track(audio.clone());
        }
        stream = stream.with_track(video);
        tracing::info!("camera switched to {wanted:?}");
        Ok(stream)
    }
}
