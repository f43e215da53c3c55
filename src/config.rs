//! Relay configuration.
//!
//! Every field has a default, so `{}` is a complete configuration:
//!
//! ```
//! let config = interpose::config::RelayConfig::from_json(r#"{"ignore_patterns": [".*/health"]}"#).unwrap();
//! assert_eq!(config.ignore_patterns, vec![".*/health"]);
//! assert_eq!(config.max_frame_payload, interpose::config::DEFAULT_MAX_FRAME_PAYLOAD);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 64 MiB.
pub const DEFAULT_MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Channels whose URL fully matches one of these regexes are forward-only.
    pub ignore_patterns: Vec<String>,
    /// Makes every channel forward-only.
    pub forward_all: bool,
    /// Frames with a larger payload are streamed through without being buffered or observed.
    pub max_frame_payload: u64,
    pub handshake_poll_interval_ms: u64,
    /// How long to wait for a handshake record to be stored before refusing the channel.
    pub handshake_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            ignore_patterns: Vec::new(),
            forward_all: false,
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            handshake_poll_interval_ms: 10,
            handshake_timeout_ms: 5000,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<RelayConfig, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RelayConfig, Error> {
        let text = std::fs::read_to_string(path)?;
        RelayConfig::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        // a struct of plain fields always serializes
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn handshake_poll_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
