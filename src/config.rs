use std::path::Path;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::CallError;
use crate::peer::connection::validate_ice_servers;
use crate::peer::types::ServerConfig;

pub const TURN_URL_ENV: &str = "PEERCALL_TURN_URL";
pub const TURN_USERNAME_ENV: &str = "PEERCALL_TURN_USERNAME";
pub const TURN_CREDENTIAL_ENV: &str = "PEERCALL_TURN_CREDENTIAL";

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Settings for one party's call coordinator.
///
/// Every field has a default, so a partial JSON document is enough. TURN
/// credentials are a secret and are normally injected from the environment
/// with [`CallConfig::with_turn_from_env`] rather than stored in the file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// How long `calling` / `ringing` may last before the call counts as missed.
    pub ring_timeout_secs: u64,
    /// How long a disconnected or failed connection may try to recover.
    pub disconnect_grace_secs: u64,
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
    /// Delete `calls/{callId}` once both parties have seen a terminal status.
    pub purge_finished_records: bool,
    pub log_filter: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ring_timeout_secs: 45,
            disconnect_grace_secs: 10,
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
            purge_finished_records: true,
            log_filter: "peercall=info".into(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(text: &str) -> Result<Self, CallError> {
        let config: CallConfig =
            serde_json::from_str(text).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Appends a TURN relay taken from `PEERCALL_TURN_*` when the url is set.
    pub fn with_turn_from_env(self) -> Result<Self, CallError> {
        self.with_turn_from(|key| std::env::var(key).ok())
    }

    fn with_turn_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CallError> {
        let Some(url) = lookup(TURN_URL_ENV).filter(|u| !u.is_empty()) else {
            return Ok(self);
        };
        self.ice_servers.retain(|s| s.id != "env-turn");
        self.ice_servers.push(ServerConfig {
            id: "env-turn".into(),
            r#type: "turn".into(),
            url,
            username: lookup(TURN_USERNAME_ENV),
            credential: lookup(TURN_CREDENTIAL_ENV),
        });
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.ice_servers.is_empty() {
            return Err(CallError::Config("at least one ICE server is required".into()));
        }
        validate_ice_servers(&self.ice_servers)?;
        if self.ring_timeout_secs == 0 {
            return Err(CallError::Config("ringTimeoutSecs must be positive".into()));
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}
