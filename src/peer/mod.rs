pub mod connection;
pub mod ice;
pub mod monitor;
pub mod session;
pub mod types;

pub use connection::{
    IceState, PeerConnection, PeerConnector, PeerEvent, PeerEventSink, PeerState, RtcConnector,
};
pub use ice::{CandidateQueue, CandidateSummary};
pub use monitor::{ConnectionMonitor, MonitorAction, MonitorUpdate};
pub use session::{CandidateDisposition, PeerSession};
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
