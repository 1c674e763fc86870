//! Sensor change observers
//!
//! Observers are invoked from whichever thread routes an `IR:` push line,
//! while the receive lock is held. They must return quickly. Commands issued
//! on the [`Dispenser`](super::Dispenser) from inside a callback are not sent
//! and come back unanswered; hand the value off through a channel if real
//! work is needed.
//!
//! ```rust
//! use dispenser_core::protocol::{ObserverRegistry, SensorState};
//! use std::sync::Arc;
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let mut observers = ObserverRegistry::new();
//! observers.add(Arc::new(move |state: SensorState| {
//!     let _ = tx.send(state);
//! }));
//!
//! observers.notify_all(SensorState::High);
//! assert_eq!(rx.try_recv().unwrap(), SensorState::High);
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use super::commands::SensorState;

/// Receives sensor transitions pushed by the dispenser
pub trait SensorObserver: Send + Sync {
    /// Called once per `IR:` push line, in registration order
    fn on_sensor_change(&self, state: SensorState);
}

impl<F> SensorObserver for F
where
    F: Fn(SensorState) + Send + Sync,
{
    fn on_sensor_change(&self, state: SensorState) {
        self(state)
    }
}

/// Ordered list of observers
///
/// Duplicates are allowed; an observer registered twice runs twice per event.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Vec<Arc<dyn SensorObserver>>,
}

impl ObserverRegistry {
    /// Empty registry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Append an observer
    pub fn add(&mut self, observer: Arc<dyn SensorObserver>) {
        self.observers.push(observer);
    }

    /// Invoke every observer in registration order
    ///
    /// A panicking observer is logged and skipped; the rest still run.
    /// Returns how many observers panicked.
    pub fn notify_all(&self, state: SensorState) -> usize {
        let mut failures = 0;
        for (index, observer) in self.observers.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| observer.on_sensor_change(state)));
            if let Err(panic_info) = result {
                failures += 1;
                warn!(
                    "Sensor observer #{} panicked on {}: {}",
                    index,
                    state,
                    panic_message(panic_info.as_ref())
                );
            }
        }
        failures
    }

    /// Number of registrations, duplicates included
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
