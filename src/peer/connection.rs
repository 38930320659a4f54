use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::errors::CallError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, TrackKind};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::session::RemoteTrack;
use crate::utils::add_ice_url_scheme;

/// Aggregate peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// What a peer connection reports back while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerState),
    IceState(IceState),
}

pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One end of a media session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError>;

    /// An offer with `ice_restart` set carries fresh ICE credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError>;

    /// Swaps the track behind the video sender without renegotiating.
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError>;

    /// Logs the nominated candidate pair, if any.
    async fn log_selected_pair(&self, moment: &str);

    async fn close(&self) -> Result<(), CallError>;
}

/// Opens peer connections against a list of ICE servers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        ice_servers: &[ServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError>;
}

pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), CallError> {
    for server in servers {
        if server.url.is_empty() {
            return Err(CallError::Config(format!("server {} has an empty url", server.id)));
        }
        if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
            return Err(CallError::Config(format!(
                "TURN server {} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => return None,
    })
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

/// [`PeerConnector`] backed by webrtc-rs.
#[derive(Debug, Default, Clone)]
pub struct RtcConnector;

impl RtcConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        servers: &[ServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        validate_ice_servers(servers)?;

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(servers)).await?);
        info!(servers = servers.len(), "peer connection created");

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!("ICE candidate gathering completed");
                    return;
                };
                dump_candidate("LOCAL", &c);
                match c.to_json() {
                    Ok(init) => sink(PeerEvent::LocalCandidate(IceCandidate::from_rtc(init))),
                    Err(e) => warn!(error = %e, "could not serialise local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                info!(id = %track.id(), ?kind, "remote track");
                sink(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                }));
                Box::pin(async {})
            },
        ));

        let sink = events.clone();
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(state = ?st, "peer connection state changed");
            if matches!(
                st,
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
            ) {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move { dump_selected_pair(&pc, "BEFORE-FAIL").await });
                }
            }
            if let Some(state) = peer_state(st) {
                sink(PeerEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            debug!(state = ?st, "ICE connection state changed");
            if let Some(state) = ice_state(st) {
                sink(PeerEvent::IceState(state));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerConnection {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeerConnection {
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        let sender = self.pc.add_track(track.rtc_track()).await?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender.clone());
        }
        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
        debug!(id = track.id(), kind = ?track.kind(), "local track attached");
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        self.pc.add_ice_candidate(candidate.to_rtc()).await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        let sender = self
            .video_sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CallError::Peer("no outbound video sender".into()))?;
        sender.replace_track(Some(track.rtc_track())).await?;
        Ok(())
    }

    async fn log_selected_pair(&self, moment: &str) {
        dump_selected_pair(&self.pc, moment).await;
    }

    async fn close(&self) -> Result<(), CallError> {
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_without_credentials_is_invalid() {
        let servers = vec![ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: Some("u".into()),
            credential: None,
        }];
        assert!(matches!(
            validate_ice_servers(&servers),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    fn server_urls_get_a_scheme() {
        let servers = vec![
            ServerConfig::stun("s", "stun.example.org:19302"),
            ServerConfig {
                id: "t".into(),
                r#type: "turn".into(),
                url: "relay.example.org:3478".into(),
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ];
        validate_ice_servers(&servers).unwrap();
        let rtc = ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:19302".to_string()]);
        assert_eq!(rtc[1].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(rtc[1].username, "u");
        assert_eq!(rtc[1].credential, "p");
    }

    #[test]
    fn unspecified_states_are_not_forwarded() {
        assert_eq!(peer_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            ice_state(RTCIceConnectionState::Completed),
            Some(IceState::Completed)
        );
    }

    #[tokio::test]
    async fn rtc_connector_builds_offer_with_tracks() {
        let events: PeerEventSink = Arc::new(|_| {});
        let pc = RtcConnector::new()
            .connect(&[ServerConfig::stun("s", "stun:127.0.0.1:3478")], events)
            .await
            .unwrap();
        let stream = crate::media::MediaStream::new("s1")
            .with_track(Arc::new(LocalTrack::new(TrackKind::Audio, None, "s1")));
        for track in stream.tracks() {
            pc.add_track(track.clone()).await.unwrap();
        }
        let offer = pc.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        pc.close().await.unwrap();
    }
}
