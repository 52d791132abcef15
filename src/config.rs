// Manager configuration.
// Logging can only be switched off by hand in development builds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    // Flip to false to silence logging entirely in a debug build.
    // Only consulted in debug builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Bounded wait applied to every description step.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_VIDEO_SOURCE: &str = "video";

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".into(),
        "stun:stun1.l.google.com:19302".into(),
    ]
}

/// Runtime configuration of a [`PeerConnectionManager`](crate::PeerConnectionManager).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Raw ICE server descriptors, e.g. `turn:user:pass@0.0.0.0:3478`
    pub ice_servers: Vec<String>,
    /// Capture source id used for every outbound video track
    pub video_source: String,
    /// Optional capture source id for an outbound audio track
    pub audio_source: Option<String>,
    pub negotiation_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            video_source: DEFAULT_VIDEO_SOURCE.into(),
            audio_source: None,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn with_ice_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_video_source(mut self, source: impl Into<String>) -> Self {
        self.video_source = source.into();
        self
    }

    pub fn with_audio_source(mut self, source: impl Into<String>) -> Self {
        self.audio_source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_public_stun_and_ten_second_budget() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.ice_servers.len(), 2);
        assert!(cfg.ice_servers[0].starts_with("stun:"));
        assert_eq!(cfg.negotiation_timeout(), Duration::from_secs(10));
        assert!(cfg.audio_source.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = ManagerConfig::from_json_str(
            r#"{"ice_servers": ["turn:u:p@0.0.0.0:3478"], "negotiation_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(cfg.ice_servers, vec!["turn:u:p@0.0.0.0:3478".to_string()]);
        assert_eq!(cfg.negotiation_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.video_source, DEFAULT_VIDEO_SOURCE);
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = ManagerConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
