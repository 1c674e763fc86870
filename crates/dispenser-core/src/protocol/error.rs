//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the dispenser
///
/// Only resource acquisition failures surface during normal operation. Read and
/// write hiccups, reply timeouts and observer panics are absorbed by the client
/// and show up in [`DispenserStats`](super::DispenserStats) instead.
#[derive(Error, Debug)]
pub enum DispenserError {
    /// Discovery found no candidate port
    #[error("No serial device found (plug in the dispenser)")]
    DeviceNotFound,

    /// The port exists but could not be opened or configured
    #[error("Failed to open {endpoint}: {reason}")]
    TransportOpenFailed {
        /// Port path
        endpoint: String,
        /// Driver message
        reason: String,
    },

    /// `close` already ran
    #[error("Dispenser connection is closed")]
    Closed,

    /// A setting is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispenserError {
    /// Build a [`DispenserError::TransportOpenFailed`] for `endpoint`
    pub fn open_failed(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::TransportOpenFailed {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}
