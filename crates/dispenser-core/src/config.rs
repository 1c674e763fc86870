//! Client configuration
//!
//! All timings are stored in milliseconds so the file format stays plain JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    DispenserError, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, DEFAULT_REPLY_TIMEOUT_MS,
};

/// Upper bound for every configured wait, in milliseconds
pub const MAX_WAIT_MS: u64 = 60_000;

/// Upper bound for the receive thread back-off, in milliseconds
pub const MAX_IDLE_SLEEP_MS: u64 = 1_000;

/// Settings for opening and driving a [`Dispenser`](crate::protocol::Dispenser)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispenserConfig {
    /// Serial port to open; discovered automatically when `None`
    pub port_name: Option<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound of a single line read
    pub read_timeout_ms: u64,
    /// How long a command waits for its reply
    pub reply_timeout_ms: u64,
    /// Window for draining boot chatter after the port opens
    pub warmup_ms: u64,
    /// Pause after opening the port; the board resets when DTR toggles
    pub boot_delay_ms: u64,
    /// Receive thread back-off when no line arrived
    pub idle_sleep_ms: u64,
    /// How long `close` waits for the receive thread
    pub join_timeout_ms: u64,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            warmup_ms: 2000,
            boot_delay_ms: 2000,
            idle_sleep_ms: 10,
            join_timeout_ms: 500,
        }
    }
}

impl DispenserConfig {
    /// Default settings for a specific port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, DispenserError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DispenserError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DispenserError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject zero timeouts and waits beyond [`MAX_WAIT_MS`]
    pub fn validate(&self) -> Result<(), DispenserError> {
        if self.baud_rate == 0 {
            return Err(DispenserError::InvalidConfig(
                "baud_rate must be greater than zero".to_string(),
            ));
        }
        check_range("read_timeout_ms", self.read_timeout_ms, 1, MAX_WAIT_MS)?;
        check_range("reply_timeout_ms", self.reply_timeout_ms, 1, MAX_WAIT_MS)?;
        check_range("warmup_ms", self.warmup_ms, 0, MAX_WAIT_MS)?;
        check_range("boot_delay_ms", self.boot_delay_ms, 0, MAX_WAIT_MS)?;
        check_range("join_timeout_ms", self.join_timeout_ms, 0, MAX_WAIT_MS)?;
        check_range("idle_sleep_ms", self.idle_sleep_ms, 0, MAX_IDLE_SLEEP_MS)?;
        Ok(())
    }

    /// Upper bound of a single line read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// How long a command waits for its reply
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Boot chatter drain window
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Pause after opening the port
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    /// Receive thread back-off
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Receive thread join window
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), DispenserError> {
    if value < min || value > max {
        return Err(DispenserError::InvalidConfig(format!(
            "{} must be between {} and {} (got {})",
            name, min, max, value
        )));
    }
    Ok(())
}
