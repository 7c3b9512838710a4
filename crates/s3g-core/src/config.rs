//! Driver configuration
//!
//! Link timing, retry budgets and firmware version bounds. Stored as JSON
//! next to the machine definition.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{DEFAULT_BAUD_RATE, DEFAULT_RETRIES, HANDSHAKE_TIMEOUT_MS, RESET_SETTLE_MS};
use crate::version::Version;

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Serial port name
    pub port_name: String,

    /// Baud rate
    pub baud_rate: u32,

    /// Read timeout while probing for the board, in milliseconds
    pub handshake_timeout_ms: u64,

    /// Read timeout once connected; `None` keeps the handshake timeout.
    /// Ignored for firmware older than 2.0, which always reads without a timeout.
    pub read_timeout_ms: Option<u64>,

    /// Wait after a failed probe or a reset pulse, in milliseconds
    pub reset_settle_ms: u64,

    /// Attempts for ordinary commands and queries
    pub retries: u32,

    /// Attempts when probing each tool board (absent boards are expected)
    pub tool_probe_attempts: u32,

    /// How many times a buffered command is resent after the board reports
    /// a full command queue
    pub buffer_full_retries: u32,

    /// Pause between buffer-full resends, in milliseconds
    pub buffer_full_backoff_ms: u64,

    /// Oldest motherboard firmware accepted
    pub minimum_version: Version,

    /// Firmware the driver is tuned for; older (but accepted) firmware is
    /// logged at connect time
    pub preferred_version: Version,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            read_timeout_ms: None,
            reset_settle_ms: RESET_SETTLE_MS,
            retries: DEFAULT_RETRIES,
            tool_probe_attempts: 2,
            buffer_full_retries: 50,
            buffer_full_backoff_ms: 100,
            minimum_version: Version::new(1, 1),
            preferred_version: Version::new(2, 0),
        }
    }
}

impl DriverConfig {
    /// Parse from a JSON string; missing fields take their defaults
    pub fn from_json_str(json: &str) -> io::Result<Self> {
        serde_json::from_str(json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save as pretty-printed JSON
    pub fn save_json_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Timeout for the version probes during the handshake
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Wait after opening the port or pulsing reset
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Steady-state read timeout for firmware with bounded latency
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.unwrap_or(self.handshake_timeout_ms))
    }

    /// Pause before resending a buffered command the board could not queue
    pub fn buffer_full_backoff(&self) -> Duration {
        Duration::from_millis(self.buffer_full_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.baud_rate, 38400);
        assert_eq!(config.handshake_timeout(), Duration::from_millis(2600));
        assert_eq!(config.reset_settle(), Duration::from_millis(2600));
        assert_eq!(config.retries, 5);
        assert_eq!(config.minimum_version, Version::new(1, 1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = DriverConfig::from_json_str(
            r#"{ "port_name": "/dev/ttyUSB0", "reset_settle_ms": 5, "read_timeout_ms": 500 }"#,
        )
        .unwrap();
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.reset_settle_ms, 5);
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
        assert_eq!(config.tool_probe_attempts, 2);
    }

    #[test]
    fn test_invalid_json() {
        let err = DriverConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.json");
        let config = DriverConfig {
            minimum_version: Version::new(1, 4),
            ..Default::default()
        };
        config.save_json_file(&path).unwrap();
        assert_eq!(DriverConfig::from_json_file(&path).unwrap(), config);
    }
}
