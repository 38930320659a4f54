use tracing::{info, warn};

use crate::peer::connection::{IceState, PeerState};
use crate::session::Connectivity;

/// What the coordinator should do after a state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    None,
    /// Media is flowing; enter `connected` and start the duration counter.
    Connected,
    /// Open a recovery window with this generation.
    StartGrace(u64),
    /// Restart ICE once and open a recovery window with this generation.
    RestartIce(u64),
    /// Recovery failed; end the call.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorUpdate {
    /// Set when the connectivity value changed.
    pub connectivity: Option<Connectivity>,
    pub action: MonitorAction,
}

/// Recovery policy over the aggregate and ICE connection states.
///
/// A disruption opens a grace window; recovery inside it closes the window,
/// expiry terminates the call. ICE failure gets one restart per disruption.
#[derive(Debug, Default)]
pub struct ConnectionMonitor {
    connectivity: Connectivity,
    grace: Option<u64>,
    generation: u64,
    restart_used: bool,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn grace_open(&self) -> bool {
        self.grace.is_some()
    }

    pub fn on_peer_state(&mut self, state: PeerState) -> MonitorUpdate {
        match state {
            PeerState::New => self.update(Connectivity::New, MonitorAction::None),
            PeerState::Connecting => self.update(Connectivity::Connecting, MonitorAction::None),
            PeerState::Connected => self.recovered(),
            PeerState::Disconnected => self.disrupted(),
            PeerState::Failed => self.failed(),
            PeerState::Closed => {
                self.grace = None;
                self.update(Connectivity::Closed, MonitorAction::None)
            }
        }
    }

    pub fn on_ice_state(&mut self, state: IceState) -> MonitorUpdate {
        match state {
            IceState::New => self.update(self.connectivity, MonitorAction::None),
            IceState::Checking => {
                let connectivity = match self.connectivity {
                    Connectivity::New => Connectivity::Connecting,
                    other => other,
                };
                self.update(connectivity, MonitorAction::None)
            }
            IceState::Connected | IceState::Completed => self.recovered(),
            IceState::Disconnected => self.disrupted(),
            IceState::Failed => self.failed(),
            IceState::Closed => self.update(self.connectivity, MonitorAction::None),
        }
    }

    /// A recovery window ran out. Stale generations are ignored.
    pub fn grace_expired(&mut self, generation: u64) -> MonitorUpdate {
        if self.grace != Some(generation) {
            return self.update(self.connectivity, MonitorAction::None);
        }
        self.grace = None;
        warn!(generation, "connection did not recover within the grace period");
        self.update(Connectivity::Failed, MonitorAction::Terminate)
    }

    fn recovered(&mut self) -> MonitorUpdate {
        if let Some(generation) = self.grace.take() {
            info!(generation, "connection recovered during grace period");
            self.restart_used = false;
        }
        self.update(Connectivity::Connected, MonitorAction::Connected)
    }

    fn disrupted(&mut self) -> MonitorUpdate {
        if self.grace.is_some() {
            return self.update(self.connectivity, MonitorAction::None);
        }
        let generation = self.open_grace();
        self.update(Connectivity::Disconnected, MonitorAction::StartGrace(generation))
    }

    fn failed(&mut self) -> MonitorUpdate {
        if !self.restart_used {
            self.restart_used = true;
            let generation = self.open_grace();
            return self.update(Connectivity::Reconnecting, MonitorAction::RestartIce(generation));
        }
        if self.grace.is_some() {
            // restart already in flight, its window decides
            return self.update(self.connectivity, MonitorAction::None);
        }
        self.update(Connectivity::Failed, MonitorAction::Terminate)
    }

    fn open_grace(&mut self) -> u64 {
        self.generation += 1;
        self.grace = Some(self.generation);
        self.generation
    }

    fn update(&mut self, connectivity: Connectivity, action: MonitorAction) -> MonitorUpdate {
        let changed = connectivity != self.connectivity;
        self.connectivity = connectivity;
        MonitorUpdate {
            connectivity: changed.then_some(connectivity),
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connects_through_checking() {
        let mut m = ConnectionMonitor::new();
        assert_eq!(
            m.on_ice_state(IceState::Checking).connectivity,
            Some(Connectivity::Connecting)
        );
        let up = m.on_peer_state(PeerState::Connected);
        assert_eq!(up.action, MonitorAction::Connected);
        assert_eq!(up.connectivity, Some(Connectivity::Connected));
        // a second report is not a new transition
        assert_eq!(m.on_ice_state(IceState::Completed).connectivity, None);
    }

    #[test]
    fn disconnect_recovers_inside_grace() {
        let mut m = ConnectionMonitor::new();
        m.on_peer_state(PeerState::Connected);
        let down = m.on_ice_state(IceState::Disconnected);
        assert_eq!(down.action, MonitorAction::StartGrace(1));
        assert_eq!(
            m.on_peer_state(PeerState::Disconnected).action,
            MonitorAction::None
        );
        assert_eq!(m.on_ice_state(IceState::Connected).action, MonitorAction::Connected);
        assert!(!m.grace_open());
        // the old window firing late changes nothing
        assert_eq!(m.grace_expired(1).action, MonitorAction::None);
        assert_eq!(m.connectivity(), Connectivity::Connected);
    }

    #[test]
    fn disconnect_without_recovery_terminates() {
        let mut m = ConnectionMonitor::new();
        m.on_peer_state(PeerState::Connected);
        let MonitorAction::StartGrace(generation) = m.on_peer_state(PeerState::Disconnected).action
        else {
            panic!("expected a grace window");
        };
        let end = m.grace_expired(generation);
        assert_eq!(end.action, MonitorAction::Terminate);
        assert_eq!(end.connectivity, Some(Connectivity::Failed));
    }

    #[test]
    fn ice_failure_restarts_once() {
        let mut m = ConnectionMonitor::new();
        m.on_peer_state(PeerState::Connected);
        assert_eq!(m.on_ice_state(IceState::Failed).action, MonitorAction::RestartIce(1));
        assert_eq!(m.connectivity(), Connectivity::Reconnecting);
        // aggregate failure reported alongside waits for the restart window
        assert_eq!(m.on_peer_state(PeerState::Failed).action, MonitorAction::None);
        assert_eq!(m.grace_expired(1).action, MonitorAction::Terminate);
        assert_eq!(m.on_ice_state(IceState::Failed).action, MonitorAction::Terminate);
    }

    #[test]
    fn restart_allowance_resets_after_recovery() {
        let mut m = ConnectionMonitor::new();
        m.on_peer_state(PeerState::Connected);
        assert_eq!(m.on_ice_state(IceState::Failed).action, MonitorAction::RestartIce(1));
        assert_eq!(m.on_ice_state(IceState::Connected).action, MonitorAction::Connected);
        assert_eq!(m.on_ice_state(IceState::Failed).action, MonitorAction::RestartIce(2));
    }
}
