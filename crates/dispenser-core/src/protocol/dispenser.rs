//! Dispenser client
//!
//! Owns the transport, a background receive thread, and the per-command reply
//! wait. Lines are read by whichever party holds the receive lock: the
//! background thread most of the time, the foreground caller while it waits
//! for a reply. Both route lines through the same function, so a push event is
//! handled exactly once no matter who reads it.

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::commands::{parse_angle, Command, InboundLine, SensorState};
use super::line::{deadline_after, LineReader};
use super::observer::{ObserverRegistry, SensorObserver};
use super::serial::{configure_port, find_port, open_port, DiscoveryPaths};
use super::stream::{CommunicationChannel, SerialChannel};
use super::DispenserError;
use crate::config::DispenserConfig;

/// Extension trait for timeout-capable thread joins
trait JoinTimeout {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()>;
}

impl<T: Send + 'static> JoinTimeout for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> thread::Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        // The watchdog outlives a stuck thread; it is reaped at process exit
        thread::spawn(move || {
            let result = self.join();
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout) {
            Ok(join_result) => join_result.map(|_| ()),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(Box::new(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "Thread join timeout"),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(Box::new(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "Thread panicked during join",
                ),
            )),
        }
    }
}

/// Correlation state of the command in flight
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplySlot {
    Idle,
    AwaitingReply(&'static str),
    Resolved(String),
}

/// Lock-free cache of the last sensor reading
struct AtomicSensorState(AtomicU8);

impl AtomicSensorState {
    fn new() -> Self {
        Self(AtomicU8::new(SensorState::Unknown as u8))
    }

    fn load(&self) -> SensorState {
        SensorState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: SensorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Counters describing link health since the client was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenserStats {
    /// Commands written to the device
    pub commands_sent: u64,
    /// Commands whose reply arrived in time
    pub replies_received: u64,
    /// Commands that gave up waiting for their reply
    pub reply_timeouts: u64,
    /// Failed writes
    pub write_errors: u64,
    /// Non-blank lines read from the device
    pub lines_received: u64,
    /// `IR:` push lines dispatched to observers
    pub pushes_dispatched: u64,
    /// Observer invocations that panicked
    pub observer_panics: u64,
    /// Lines matching neither a pending reply nor a known form
    pub unrecognized_lines: u64,
}

#[derive(Default)]
struct Counters {
    commands_sent: AtomicU64,
    replies_received: AtomicU64,
    reply_timeouts: AtomicU64,
    write_errors: AtomicU64,
    lines_received: AtomicU64,
    pushes_dispatched: AtomicU64,
    observer_panics: AtomicU64,
    unrecognized_lines: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispenserStats {
        DispenserStats {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            reply_timeouts: self.reply_timeouts.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            pushes_dispatched: self.pushes_dispatched.load(Ordering::Relaxed),
            observer_panics: self.observer_panics.load(Ordering::Relaxed),
            unrecognized_lines: self.unrecognized_lines.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the foreground handle and the receive thread
struct Shared {
    /// Receive lock: whoever holds it is the only reader of the transport
    reader: Mutex<Option<LineReader>>,
    reply: Mutex<ReplySlot>,
    observers: RwLock<ObserverRegistry>,
    sensor: AtomicSensorState,
    running: AtomicBool,
    counters: Counters,
}

impl Shared {
    /// Read at most one line within `budget` and route it
    ///
    /// Must be called with the receive lock held. Returns whether a line arrived.
    fn pump(&self, reader: &mut Option<LineReader>, budget: Duration) -> bool {
        let Some(reader) = reader.as_mut() else {
            return false;
        };
        match reader.read_line_within(budget) {
            Some(line) => {
                Counters::bump(&self.counters.lines_received);
                self.route_line(line);
                true
            }
            None => false,
        }
    }

    /// Hand a line to the waiting command if it matches, otherwise classify it
    fn route_line(&self, line: String) {
        trace!("rx: {}", line);
        {
            let mut reply = self.reply.lock();
            if let ReplySlot::AwaitingReply(prefix) = *reply {
                if line.starts_with(prefix) {
                    // Cached here, in stream order, so a later push read by
                    // the receive thread is never overwritten by this reply
                    if let InboundLine::SensorReply(state) = InboundLine::parse(&line) {
                        self.sensor.store(state);
                    }
                    *reply = ReplySlot::Resolved(line);
                    return;
                }
            }
        }
        self.classify(&line);
    }

    fn classify(&self, line: &str) {
        match InboundLine::parse(line) {
            InboundLine::SensorReply(state) => self.sensor.store(state),
            InboundLine::SensorPush(state) => {
                self.sensor.store(state);
                Counters::bump(&self.counters.pushes_dispatched);
                let failures = self.observers.read().notify_all(state);
                self.counters
                    .observer_panics
                    .fetch_add(failures as u64, Ordering::Relaxed);
            }
            InboundLine::MoveAck(_) | InboundLine::Unrecognized => {
                Counters::bump(&self.counters.unrecognized_lines);
                trace!("Ignoring unsolicited line: {}", line);
            }
        }
    }

    fn take_resolved(&self) -> Option<String> {
        let mut reply = self.reply.lock();
        match std::mem::replace(&mut *reply, ReplySlot::Idle) {
            ReplySlot::Resolved(line) => Some(line),
            other => {
                *reply = other;
                None
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn receive_loop(shared: Arc<Shared>, read_timeout: Duration, idle_sleep: Duration) {
    debug!("Receive thread started");
    while shared.is_running() {
        let mut reader = shared.reader.lock();
        let got_line = shared.pump(&mut reader, read_timeout);
        MutexGuard::unlock_fair(reader);
        if !got_line {
            thread::sleep(idle_sleep);
        }
    }
    debug!("Receive thread stopped");
}

/// Client for the pill dispenser board
///
/// All operations take `&self`; wrap in an [`Arc`] to share between threads.
/// Commands are serialized: a second caller waits until the first command's
/// reply arrived or timed out.
pub struct Dispenser {
    endpoint: String,
    config: DispenserConfig,
    shared: Arc<Shared>,
    writer: Mutex<Option<Box<dyn CommunicationChannel>>>,
    command_lock: Mutex<()>,
    /// Thread currently holding `command_lock`
    command_owner: Mutex<Option<ThreadId>>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispenser {
    /// Open the serial port named in `config`, discovering it when unset
    pub fn open(config: DispenserConfig) -> Result<Self, DispenserError> {
        config.validate()?;
        let endpoint = match &config.port_name {
            Some(name) => name.clone(),
            None => find_port(&DiscoveryPaths::default())?,
        };

        let mut port = open_port(&endpoint, config.baud_rate, config.read_timeout())?;
        configure_port(&endpoint, port.as_mut())?;
        info!("Opened {} at {} baud", endpoint, config.baud_rate);

        Self::with_channel(endpoint, Box::new(SerialChannel::new(port)), config)
    }

    /// Start a client on an already opened channel
    ///
    /// Waits out the boot delay, starts the receive thread, then drains boot
    /// chatter for up to the warm-up window.
    pub fn with_channel(
        endpoint: impl Into<String>,
        mut channel: Box<dyn CommunicationChannel>,
        config: DispenserConfig,
    ) -> Result<Self, DispenserError> {
        config.validate()?;
        let endpoint = endpoint.into();
        // Drop bytes queued before the port was opened
        if let Err(e) = channel.clear_input_buffer() {
            debug!("Could not clear input buffer on {}: {}", endpoint, e);
        }
        let writer = channel
            .try_clone()
            .map_err(|e| DispenserError::open_failed(&endpoint, e))?;

        if !config.boot_delay().is_zero() {
            debug!("Waiting {:?} for the board to boot", config.boot_delay());
            thread::sleep(config.boot_delay());
        }

        let shared = Arc::new(Shared {
            reader: Mutex::new(Some(LineReader::new(channel, config.read_timeout()))),
            reply: Mutex::new(ReplySlot::Idle),
            observers: RwLock::new(ObserverRegistry::new()),
            sensor: AtomicSensorState::new(),
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let rx_thread = {
            let shared = shared.clone();
            let read_timeout = config.read_timeout();
            let idle_sleep = config.idle_sleep();
            thread::Builder::new()
                .name("dispenser-rx".to_string())
                .spawn(move || receive_loop(shared, read_timeout, idle_sleep))
                .map_err(|e| DispenserError::open_failed(&endpoint, e))?
        };

        let dispenser = Self {
            endpoint,
            config,
            shared,
            writer: Mutex::new(Some(writer)),
            command_lock: Mutex::new(()),
            command_owner: Mutex::new(None),
            rx_thread: Mutex::new(Some(rx_thread)),
        };
        dispenser.warm_up();
        Ok(dispenser)
    }

    fn warm_up(&self) {
        let deadline = deadline_after(self.config.warmup());
        let mut drained = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Some(mut reader) = self.shared.reader.try_lock_until(deadline) else {
                break;
            };
            if !self.shared.pump(&mut reader, remaining) {
                break;
            }
            drained += 1;
        }
        debug!("Warm-up drained {} line(s)", drained);
    }

    /// Advance the carousel by its fixed increment
    ///
    /// Returns the acknowledged angle, or `None` if no (parseable) reply
    /// arrived in time.
    pub fn send_fixed_move(&self) -> Result<Option<i32>, DispenserError> {
        let reply = self.transact(Command::Turn)?;
        Ok(reply.and_then(|line| move_angle(&line)))
    }

    /// Move the servo to `angle`
    ///
    /// The angle is not range-checked; the firmware applies its own wrapping
    /// and reports the resulting position.
    pub fn send_absolute_move(&self, angle: i32) -> Result<Option<i32>, DispenserError> {
        let reply = self.transact(Command::SetAngle(angle))?;
        Ok(reply.and_then(|line| move_angle(&line)))
    }

    /// Ask the board for its IR reading
    ///
    /// Falls back to the cached reading (or `Unknown`) when the reply is missing
    /// or malformed.
    pub fn query_sensor_state(&self) -> Result<SensorState, DispenserError> {
        let reply = self.transact(Command::QuerySensor)?;
        let parsed = reply.as_deref().and_then(|line| match InboundLine::parse(line) {
            InboundLine::SensorReply(state) => Some(state),
            _ => None,
        });
        match parsed {
            Some(state) => Ok(state),
            None => {
                let cached = self.shared.sensor.load();
                debug!("No sensor reply, using cached {}", cached);
                Ok(cached)
            }
        }
    }

    /// Register an observer for `IR:` push events
    ///
    /// Observers run in registration order on the thread that read the line.
    /// Registering the same observer twice makes it run twice per event.
    pub fn register_state_observer(&self, observer: Arc<dyn SensorObserver>) {
        self.shared.observers.write().add(observer);
    }

    /// Last sensor reading seen from any reply or push
    pub fn cached_sensor_state(&self) -> SensorState {
        self.shared.sensor.load()
    }

    /// Port path or simulator name this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Settings the client was opened with
    pub fn config(&self) -> &DispenserConfig {
        &self.config
    }

    /// Snapshot of the link counters
    pub fn stats(&self) -> DispenserStats {
        self.shared.counters.snapshot()
    }

    /// Whether `close` has not been called yet
    pub fn is_open(&self) -> bool {
        self.shared.is_running()
    }

    /// Stop the receive thread and release the transport
    ///
    /// Safe to call more than once. Returns within roughly two join windows
    /// even if the transport is stuck in a read.
    pub fn close(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let join_timeout = self.config.join_timeout();

        let rx_thread = self.rx_thread.lock().take();
        if let Some(handle) = rx_thread {
            if handle.join_timeout(join_timeout).is_err() {
                warn!(
                    "Receive thread did not stop within {:?}; detaching it",
                    join_timeout
                );
            }
        }

        if let Some(mut writer) = self.writer.lock().take() {
            let _ = writer.flush();
        }

        match self.shared.reader.try_lock_for(join_timeout) {
            Some(mut reader) => {
                reader.take();
            }
            None => warn!("Reader still busy; it is released when the read returns"),
        }

        info!("Closed {}", self.endpoint);
    }

    fn ensure_open(&self) -> Result<(), DispenserError> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(DispenserError::Closed)
        }
    }

    /// Write `command` and wait for the line that answers it
    ///
    /// A command issued from an observer callback is dropped and reported as
    /// unanswered: the callback runs with the receive lock held, so its reply
    /// could never be read.
    fn transact(&self, command: Command) -> Result<Option<String>, DispenserError> {
        let current = thread::current().id();
        if self.dispatching_on(current) {
            warn!(
                "{} issued from an observer callback; not sent",
                command.text()
            );
            return Ok(None);
        }
        let _command_guard = self.command_lock.lock();
        let _owner = CommandOwner::claim(&self.command_owner, current);
        self.ensure_open()?;

        let prefix = command.reply_prefix();
        *self.shared.reply.lock() = ReplySlot::AwaitingReply(prefix);

        if let Err(e) = self.write_command(command) {
            Counters::bump(&self.shared.counters.write_errors);
            warn!("Failed to send {}: {}", command.text(), e);
            *self.shared.reply.lock() = ReplySlot::Idle;
            return Ok(None);
        }
        Counters::bump(&self.shared.counters.commands_sent);
        debug!("tx: {}", command.text());

        let reply = self.await_reply(prefix);
        *self.shared.reply.lock() = ReplySlot::Idle;

        match reply {
            Ok(Some(line)) => {
                Counters::bump(&self.shared.counters.replies_received);
                debug!("Reply to {}: {}", command.text(), line);
                Ok(Some(line))
            }
            Ok(None) => {
                Counters::bump(&self.shared.counters.reply_timeouts);
                warn!(
                    "No '{}' reply to {} within {:?}",
                    prefix,
                    command.text(),
                    self.config.reply_timeout()
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether `thread` is inside observer dispatch: the receive thread, or a
    /// caller already waiting for a reply
    fn dispatching_on(&self, thread: ThreadId) -> bool {
        if *self.command_owner.lock() == Some(thread) {
            return true;
        }
        self.rx_thread
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread)
    }

    fn write_command(&self, command: Command) -> Result<(), DispenserError> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(DispenserError::Closed)?;
        writer.write_all(&command.to_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn await_reply(&self, prefix: &'static str) -> Result<Option<String>, DispenserError> {
        let deadline = deadline_after(self.config.reply_timeout());
        loop {
            if let Some(line) = self.shared.take_resolved() {
                return Ok(Some(line));
            }
            self.ensure_open()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let Some(mut reader) = self.shared.reader.try_lock_until(deadline) else {
                continue;
            };
            // The receive thread may have resolved the reply while we waited for the lock
            if let Some(line) = self.shared.take_resolved() {
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.shared.pump(&mut reader, remaining) {
                drop(reader);
                trace!("Still waiting for '{}'", prefix);
                thread::sleep(self.config.idle_sleep().min(remaining));
            }
        }
    }
}

/// Records the thread holding the command lock until dropped
struct CommandOwner<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> CommandOwner<'a> {
    fn claim(slot: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> Self {
        *slot.lock() = Some(thread);
        Self(slot)
    }
}

impl Drop for CommandOwner<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

fn move_angle(line: &str) -> Option<i32> {
    line.strip_prefix(super::MOVE_REPLY_PREFIX).and_then(parse_angle)
}

impl Drop for Dispenser {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::SimulatedDevice;
    use pretty_assertions::assert_eq;

    fn quick_config() -> DispenserConfig {
        DispenserConfig {
            port_name: None,
            read_timeout_ms: 20,
            reply_timeout_ms: 300,
            warmup_ms: 100,
            boot_delay_ms: 0,
            idle_sleep_ms: 1,
            join_timeout_ms: 200,
            ..DispenserConfig::default()
        }
    }

    fn connect(device: &SimulatedDevice) -> Dispenser {
        Dispenser::with_channel("sim", device.channel(), quick_config()).unwrap()
    }

    #[test]
    fn test_atomic_sensor_state() {
        let cache = AtomicSensorState::new();
        assert_eq!(cache.load(), SensorState::Unknown);
        cache.store(SensorState::High);
        assert_eq!(cache.load(), SensorState::High);
    }

    #[test]
    fn test_move_angle() {
        assert_eq!(move_angle("OK angle=135"), Some(135));
        assert_eq!(move_angle("OK angle=x"), None);
        assert_eq!(move_angle("IR=LOW"), None);
    }

    #[test]
    fn test_route_line_resolves_awaited_prefix_only() {
        let device = SimulatedDevice::new();
        let dispenser = connect(&device);
        let shared = &dispenser.shared;

        *shared.reply.lock() = ReplySlot::AwaitingReply("IR=");
        shared.route_line("OK angle=45".to_string());
        assert_eq!(shared.take_resolved(), None);

        shared.route_line("IR=HIGH".to_string());
        assert_eq!(shared.take_resolved().as_deref(), Some("IR=HIGH"));
        assert_eq!(*shared.reply.lock(), ReplySlot::Idle);
        // The awaited reply lands in the cache before any later line is read
        assert_eq!(shared.sensor.load(), SensorState::High);
    }

    #[test]
    fn test_sensor_reply_updates_cache_without_observers() {
        let device = SimulatedDevice::new();
        let dispenser = connect(&device);
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = hits.clone();
            dispenser.register_state_observer(Arc::new(move |_state: SensorState| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        dispenser.shared.route_line("IR=LOW".to_string());

        assert_eq!(dispenser.cached_sensor_state(), SensorState::Low);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_turn_round_trip() {
        let device = SimulatedDevice::new();
        let dispenser = connect(&device);

        assert_eq!(dispenser.send_fixed_move().unwrap(), Some(45));
        assert_eq!(dispenser.send_fixed_move().unwrap(), Some(90));
        assert_eq!(device.written_lines(), vec!["TURN", "TURN"]);

        let stats = dispenser.stats();
        assert_eq!(stats.commands_sent, 2);
        assert_eq!(stats.replies_received, 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let device = SimulatedDevice::new();
        let dispenser = connect(&device);
        assert!(dispenser.is_open());

        dispenser.close();
        dispenser.close();

        assert!(!dispenser.is_open());
        assert!(matches!(
            dispenser.send_fixed_move(),
            Err(DispenserError::Closed)
        ));
    }

    #[test]
    fn test_join_timeout_reports_stuck_thread() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::spawn(move || {
            let _ = release_rx.recv();
        });

        assert!(handle.join_timeout(Duration::from_millis(20)).is_err());
        drop(release_tx);
    }
}
