//! # Dispenser Core Library
//!
//! Serial control of a pill dispenser board.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Serial port discovery and setup
//! - The line protocol client: moves, sensor queries, push notifications
//! - Debounced confirmation of sensor states
//! - A simulated board for testing without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use dispenser_core::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let dispenser = Dispenser::open(DispenserConfig::default())?;
//! dispenser.register_state_observer(Arc::new(|state: SensorState| {
//!     println!("tray sensor changed: {}", state);
//! }));
//!
//! if let Some(angle) = dispenser.send_fixed_move()? {
//!     println!("carousel at {} degrees", angle);
//! }
//!
//! let policy = ConfirmationPolicy::pill_removal(Duration::from_secs(30));
//! if wait_for_confirmed_state(&dispenser, &policy) {
//!     println!("pill taken");
//! }
//! dispenser.close();
//! # Ok::<(), DispenserError>(())
//! ```

pub mod config;
pub mod confirm;
pub mod demo;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DispenserConfig;
    pub use crate::confirm::{wait_for_confirmed_state, ConfirmationPolicy, Debouncer, SensorSource};
    pub use crate::protocol::{Dispenser, DispenserError, DispenserStats, SensorObserver, SensorState};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
