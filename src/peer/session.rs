use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::CallError;
use crate::media::{LocalTrack, MediaStream};
use crate::peer::connection::{PeerConnection, PeerConnector, PeerEventSink};
use crate::peer::ice::{analyze_candidates, CandidateQueue, CandidateSummary};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};

/// What happened to a remote candidate handed to [`PeerSession::add_remote_candidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    /// The connection refused it; it is skipped.
    Rejected,
    /// The session is already closed.
    Dropped,
}

#[derive(Default)]
struct NegotiationState {
    queue: CandidateQueue,
    remote_set: bool,
    closed: bool,
}

/// One peer connection plus the candidates waiting for its remote description.
///
/// Candidates arriving while the remote description is still being applied
/// are queued; the queue is flushed under the negotiation lock, so a later
/// candidate cannot overtake a queued one.
pub struct PeerSession {
    conn: Arc<dyn PeerConnection>,
    state: Mutex<NegotiationState>,
    local_candidates: StdMutex<Vec<IceCandidate>>,
}

impl PeerSession {
    pub async fn create(
        connector: &dyn PeerConnector,
        ice_servers: &[ServerConfig],
        events: PeerEventSink,
    ) -> Result<Self, CallError> {
        let conn = connector.connect(ice_servers, events).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            conn,
            state: Mutex::new(NegotiationState::default()),
            local_candidates: StdMutex::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.conn
    }

    pub async fn attach_local_tracks(&self, stream: &MediaStream) -> Result<(), CallError> {
        for track in stream.tracks() {
            self.conn.add_track(track.clone()).await?;
        }
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        self.conn.create_offer(false).await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        self.conn.create_answer().await
    }

    pub async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.conn.set_local_description(desc).await
    }

    /// Applies the remote description, then flushes queued candidates in arrival order.
    ///
    /// Returns how many queued candidates were applied.
    pub async fn set_remote_description(&self, desc: &SessionDescription) -> Result<usize, CallError> {
        if self.state.lock().await.closed {
            return Err(CallError::Peer("peer session is closed".into()));
        }
        self.conn.set_remote_description(desc).await?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(CallError::Peer("peer session is closed".into()));
        }
        state.remote_set = true;
        let pending = state.queue.drain();
        let mut applied = 0;
        for candidate in &pending {
            match self.conn.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(error = %e, "failed to apply queued candidate, skipping"),
            }
        }
        debug!(queued = pending.len(), applied, "remote description set");
        Ok(applied)
    }

    pub async fn has_remote_description(&self) -> bool {
        self.state.lock().await.remote_set
    }

    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> CandidateDisposition {
        let mut state = self.state.lock().await;
        if state.closed {
            return CandidateDisposition::Dropped;
        }
        if !state.remote_set {
            state.queue.push(candidate);
            return CandidateDisposition::Queued;
        }
        match self.conn.add_ice_candidate(&candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                warn!(error = %e, "failed to add remote candidate, skipping");
                CandidateDisposition::Rejected
            }
        }
    }

    pub async fn queued_candidates(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub fn record_local_candidate(&self, candidate: IceCandidate) {
        self.local_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidate);
    }

    pub fn local_candidate_summary(&self) -> CandidateSummary {
        let candidates = self
            .local_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        analyze_candidates(&candidates)
    }

    pub async fn replace_outbound_video_track(&self, track: Arc<LocalTrack>) -> Result<(), CallError> {
        self.conn.replace_video_track(track).await
    }

    /// Creates an ICE-restart offer and applies it locally.
    ///
    /// This only re-gathers local candidates under fresh credentials. The
    /// offer is never sent, so the other party keeps the old credentials and
    /// a call that really lost its path is not recovered by this alone.
    pub async fn restart_ice(&self) -> Result<SessionDescription, CallError> {
        let offer = self.conn.create_offer(true).await?;
        self.conn.set_local_description(&offer).await?;
        info!("ICE restart offer applied");
        Ok(offer)
    }

    pub async fn log_selected_pair(&self, moment: &str) {
        self.conn.log_selected_pair(moment).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Closes the connection. Returns `false` when it was already closed.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }
        state.closed = true;
        state.queue.clear();
        if let Err(e) = self.conn.close().await {
            warn!(error = %e, "peer connection close failed");
        }
        info!("peer session closed");
        true
    }
}
