/// Configuration
/// Loaded from a JSON file; every field has a default so partial files work.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{DeletePolicy, MarkdError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkdConfig {
    pub session: SessionConfig,
    pub remote: RemoteConfig,
}

impl MarkdConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| MarkdError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| MarkdError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

/// Dashboard session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a first delete press stays armed
    pub confirm_window_ms: u64,

    pub delete_policy: DeletePolicy,

    /// Re-fetch the snapshot when the live channel comes back after a drop,
    /// recovering events pushed during the outage
    pub resync_on_reconnect: bool,
}

impl SessionConfig {
    pub fn confirm_window(&self) -> Duration {
        Duration::from_millis(self.confirm_window_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            confirm_window_ms: 3_000,
            delete_policy: DeletePolicy::default(),
            resync_on_reconnect: true,
        }
    }
}

/// WebSocket collaborator client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub request_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl RemoteConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before reconnect attempt number `attempt` (0-based), doubling up
    /// to the maximum
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let delay = self.reconnect_initial_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.reconnect_max_ms))
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            request_timeout_ms: 10_000,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 10_000,
        }
    }
}
