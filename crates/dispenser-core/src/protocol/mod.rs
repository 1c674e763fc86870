//! Serial Protocol Communication
//!
//! Implements the line-based protocol spoken by the pill dispenser firmware:
//! `TURN`, `SET <angle>` and `IR?` commands, their replies, and unsolicited
//! `IR:` sensor pushes.

pub mod commands;
mod dispenser;
mod error;
pub mod line;
pub mod observer;
pub mod serial;
pub mod stream;

pub use commands::{
    Command, InboundLine, SensorState, MOVE_REPLY_PREFIX, SENSOR_PUSH_PREFIX, SENSOR_REPLY_PREFIX,
};
pub use dispenser::{Dispenser, DispenserStats};
pub use error::DispenserError;
pub use line::LineReader;
pub use observer::{ObserverRegistry, SensorObserver};
pub use serial::{configure_port, find_port, list_ports, open_port, DiscoveryPaths, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel};

/// Default baud rate of the dispenser firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default upper bound of a single line read in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 300;

/// Default reply wait in milliseconds
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 1000;
