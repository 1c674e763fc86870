//! Debounced sensor confirmation
//!
//! The IR sensor flickers while a hand reaches into the tray, so a single
//! reading is not trusted. A state counts as confirmed only after a run of
//! consecutive identical readings.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::protocol::line::deadline_after;
use crate::protocol::{Dispenser, DispenserError, SensorState};

/// Anything that can produce a sensor reading on demand
pub trait SensorSource {
    /// Take one reading
    fn read_sensor(&self) -> Result<SensorState, DispenserError>;
}

impl SensorSource for Dispenser {
    fn read_sensor(&self) -> Result<SensorState, DispenserError> {
        self.query_sensor_state()
    }
}

impl<F> SensorSource for F
where
    F: Fn() -> Result<SensorState, DispenserError>,
{
    fn read_sensor(&self) -> Result<SensorState, DispenserError> {
        self()
    }
}

/// How long and how often to poll, and how many matching reads are required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    /// State to confirm
    pub target: SensorState,
    /// Give up after this long
    pub timeout: Duration,
    /// Pause between readings
    pub poll_interval: Duration,
    /// Matching readings needed in a row
    pub required_consecutive: u32,
}

impl ConfirmationPolicy {
    /// Tray emptied: three `HIGH` readings 250 ms apart
    pub fn pill_removal(timeout: Duration) -> Self {
        Self {
            target: SensorState::High,
            timeout,
            poll_interval: Duration::from_millis(250),
            required_consecutive: 3,
        }
    }
}

/// Counts consecutive readings equal to a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debouncer {
    target: SensorState,
    required: u32,
    streak: u32,
}

impl Debouncer {
    /// A `required` of zero is treated as one
    pub fn new(target: SensorState, required: u32) -> Self {
        Self {
            target,
            required: required.max(1),
            streak: 0,
        }
    }

    /// Feed one reading; `None` stands for a failed read
    ///
    /// Returns true once the streak reaches the required length.
    pub fn observe(&mut self, reading: Option<SensorState>) -> bool {
        if reading == Some(self.target) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.streak = 0;
        }
        self.is_confirmed()
    }

    /// Whether the streak reached the required length
    pub fn is_confirmed(&self) -> bool {
        self.streak >= self.required
    }

    /// Current run of matching readings
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Start counting from zero
    pub fn reset(&mut self) {
        self.streak = 0;
    }
}

/// Poll `source` until `policy.target` is read enough times in a row
///
/// Returns false when the timeout elapses first. Read errors break the streak.
pub fn wait_for_confirmed_state<S>(source: &S, policy: &ConfirmationPolicy) -> bool
where
    S: SensorSource + ?Sized,
{
    let deadline = deadline_after(policy.timeout);
    let mut debouncer = Debouncer::new(policy.target, policy.required_consecutive);
    let mut polls = 0u32;

    while Instant::now() < deadline {
        let reading = match source.read_sensor() {
            Ok(state) => Some(state),
            Err(e) => {
                debug!("Sensor read failed during confirmation: {}", e);
                None
            }
        };
        polls += 1;
        trace!("poll {}: {:?} (streak {})", polls, reading, debouncer.streak());

        if debouncer.observe(reading) {
            debug!("{} confirmed after {} poll(s)", policy.target, polls);
            return true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(policy.poll_interval.min(remaining));
    }

    debug!(
        "{} not confirmed within {:?} ({} poll(s))",
        policy.target, policy.timeout, polls
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// Replays scripted readings, then keeps returning the last one
    fn scripted(
        readings: Vec<Result<SensorState, DispenserError>>,
    ) -> (
        impl Fn() -> Result<SensorState, DispenserError>,
        std::sync::Arc<Mutex<u32>>,
    ) {
        let queue = Mutex::new(VecDeque::from(readings));
        let polls = std::sync::Arc::new(Mutex::new(0u32));
        let counter = polls.clone();
        let source = move || {
            *counter.lock() += 1;
            let mut queue = queue.lock();
            if queue.len() > 1 {
                queue.pop_front().unwrap_or(Ok(SensorState::Unknown))
            } else {
                match queue.front() {
                    Some(Ok(state)) => Ok(*state),
                    _ => Err(DispenserError::Closed),
                }
            }
        };
        (source, polls)
    }

    fn fast_policy(timeout_ms: u64) -> ConfirmationPolicy {
        ConfirmationPolicy {
            target: SensorState::High,
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(1),
            required_consecutive: 3,
        }
    }

    #[test]
    fn test_debouncer_requires_consecutive_matches() {
        let mut debouncer = Debouncer::new(SensorState::High, 3);
        assert!(!debouncer.observe(Some(SensorState::High)));
        assert!(!debouncer.observe(Some(SensorState::High)));
        assert!(!debouncer.observe(Some(SensorState::Low)));
        assert_eq!(debouncer.streak(), 0);
        assert!(!debouncer.observe(Some(SensorState::High)));
        assert!(!debouncer.observe(None));
        assert!(!debouncer.observe(Some(SensorState::High)));
        assert!(!debouncer.observe(Some(SensorState::High)));
        assert!(debouncer.observe(Some(SensorState::High)));
    }

    #[test]
    fn test_debouncer_zero_required_means_one() {
        let mut debouncer = Debouncer::new(SensorState::Low, 0);
        assert!(!debouncer.is_confirmed());
        assert!(debouncer.observe(Some(SensorState::Low)));
        debouncer.reset();
        assert!(!debouncer.is_confirmed());
    }

    #[test]
    fn test_confirms_on_sixth_poll_after_interruption() {
        use SensorState::{High, Low};
        let (source, polls) = scripted(vec![
            Ok(High),
            Ok(High),
            Ok(Low),
            Ok(High),
            Ok(High),
            Ok(High),
        ]);

        assert!(wait_for_confirmed_state(&source, &fast_policy(2000)));
        assert_eq!(*polls.lock(), 6);
    }

    #[test]
    fn test_times_out_without_streak() {
        let (source, _polls) = scripted(vec![Ok(SensorState::Low)]);
        let started = Instant::now();

        assert!(!wait_for_confirmed_state(&source, &fast_policy(50)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_read_errors_break_the_streak() {
        use SensorState::High;
        let (source, polls) = scripted(vec![
            Ok(High),
            Ok(High),
            Err(DispenserError::Closed),
            Ok(High),
            Ok(High),
            Ok(High),
        ]);

        assert!(wait_for_confirmed_state(&source, &fast_policy(2000)));
        assert_eq!(*polls.lock(), 6);
    }

    #[test]
    fn test_unbounded_timeout_does_not_panic() {
        let (source, polls) = scripted(vec![Ok(SensorState::High)]);
        let policy = ConfirmationPolicy {
            timeout: Duration::MAX,
            ..fast_policy(0)
        };

        assert!(wait_for_confirmed_state(&source, &policy));
        assert_eq!(*polls.lock(), 3);
    }

    #[test]
    fn test_pill_removal_policy() {
        let policy = ConfirmationPolicy::pill_removal(Duration::from_secs(5));
        assert_eq!(policy.target, SensorState::High);
        assert_eq!(policy.poll_interval, Duration::from_millis(250));
        assert_eq!(policy.required_consecutive, 3);
        assert_eq!(policy.timeout, Duration::from_secs(5));
    }
}
