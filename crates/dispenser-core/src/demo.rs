//! Demo Mode - Simulated dispenser firmware for testing
//!
//! Speaks the same line protocol as the real board over an in-memory channel,
//! so the client, the bench tool and the tests can run without hardware.
//! The simulated servo moves in 45 degree steps on `TURN` and wraps back to 0
//! past 180.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{CommunicationChannel, SensorState};

/// Step of a `TURN` command in degrees
pub const TURN_STEP: i32 = 45;

/// Largest servo angle
pub const MAX_ANGLE: i32 = 180;

/// Wrap a requested `SET` angle into the servo range
pub fn wrap_angle(angle: i32) -> i32 {
    angle.rem_euclid(MAX_ANGLE + 1)
}

/// Angle after one `TURN` from `angle`
pub fn next_turn_angle(angle: i32) -> i32 {
    let next = angle + TURN_STEP;
    if next > MAX_ANGLE {
        0
    } else {
        next
    }
}

struct DeviceState {
    angle: i32,
    sensor: SensorState,
    /// Stop answering commands (lines are still recorded)
    silent: bool,
    /// Probability that an `IR?` answer is flipped
    noise: f64,
    /// Lines sent ahead of the next reply
    preamble: VecDeque<String>,
    /// Lines sent right after the next reply
    postamble: VecDeque<String>,
    /// Command lines received from the client
    written: Vec<String>,
    /// Bytes received after the last newline
    partial: Vec<u8>,
    rng: StdRng,
}

/// Simulated dispenser board
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    to_host: Sender<Vec<u8>>,
    from_device: Receiver<Vec<u8>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// Create a device at angle 0 with a pill in the tray (`LOW`)
    pub fn new() -> Self {
        let (to_host, from_device) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                angle: 0,
                sensor: SensorState::Low,
                silent: false,
                noise: 0.0,
                preamble: VecDeque::new(),
                postamble: VecDeque::new(),
                written: Vec::new(),
                partial: Vec::new(),
                rng: StdRng::from_entropy(),
            })),
            to_host,
            from_device,
        }
    }

    /// A new host-side channel connected to this device
    pub fn channel(&self) -> Box<dyn CommunicationChannel> {
        Box::new(SimulatedChannel {
            device: self.clone(),
            pending: Vec::new(),
            timeout: Duration::from_millis(100),
        })
    }

    /// Emit the banner the firmware prints after reset
    pub fn emit_boot_chatter(&self) {
        self.push_line("Pill dispenser firmware");
        self.push_line("servo attached");
        self.push_line("READY");
    }

    /// Send an arbitrary line to the host
    pub fn push_line(&self, line: &str) {
        let _ = self.to_host.send(format!("{}\n", line).into_bytes());
    }

    /// Send raw bytes to the host, without adding a terminator
    pub fn push_bytes(&self, bytes: &[u8]) {
        let _ = self.to_host.send(bytes.to_vec());
    }

    /// Change the IR reading and announce it with an `IR:` push
    pub fn set_sensor(&self, sensor: SensorState) {
        self.state.lock().sensor = sensor;
        self.push_line(&format!("IR:{}", sensor));
    }

    /// Change the IR reading without announcing it
    pub fn set_sensor_quietly(&self, sensor: SensorState) {
        self.state.lock().sensor = sensor;
    }

    /// Stop (or resume) answering commands
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Flip `IR?` answers with the given probability
    pub fn set_noise(&self, probability: f64) {
        self.state.lock().noise = probability.clamp(0.0, 1.0);
    }

    /// Queue a line to be sent right before the next reply
    pub fn send_before_next_reply(&self, line: &str) {
        self.state.lock().preamble.push_back(line.to_string());
    }

    /// Queue a line to be sent right after the next reply
    pub fn send_after_next_reply(&self, line: &str) {
        self.state.lock().postamble.push_back(line.to_string());
    }

    /// Current servo angle
    pub fn angle(&self) -> i32 {
        self.state.lock().angle
    }

    /// Current IR reading, before any noise
    pub fn sensor(&self) -> SensorState {
        self.state.lock().sensor
    }

    /// Command lines received so far, without terminators
    pub fn written_lines(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    fn receive(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.partial.extend_from_slice(bytes);
        while let Some(pos) = state.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = state.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            state.written.push(line.clone());
            if state.silent {
                continue;
            }
            if let Some(reply) = Self::execute(&mut state, &line) {
                while let Some(extra) = state.preamble.pop_front() {
                    self.push_line(&extra);
                }
                self.push_line(&reply);
                while let Some(extra) = state.postamble.pop_front() {
                    self.push_line(&extra);
                }
            }
        }
    }

    fn execute(state: &mut DeviceState, line: &str) -> Option<String> {
        if line == "TURN" {
            state.angle = next_turn_angle(state.angle);
            return Some(format!("OK angle={}", state.angle));
        }
        if let Some(arg) = line.strip_prefix("SET ") {
            let requested = arg.trim().parse::<i32>().ok()?;
            state.angle = wrap_angle(requested);
            return Some(format!("OK angle={}", state.angle));
        }
        if line == "IR?" {
            let mut reading = state.sensor;
            let noise = state.noise;
            if noise > 0.0 && state.rng.gen_bool(noise) {
                reading = match reading {
                    SensorState::High => SensorState::Low,
                    _ => SensorState::High,
                };
            }
            return Some(format!("IR={}", reading));
        }
        None
    }
}

/// Host side of a [`SimulatedDevice`]
pub struct SimulatedChannel {
    device: SimulatedDevice,
    /// Bytes of a received chunk not yet handed to the caller
    pending: Vec<u8>,
    timeout: Duration,
}

impl Read for SimulatedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.device.from_device.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "simulated read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for SimulatedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.device.receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimulatedChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(self.device.channel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_line(channel: &mut Box<dyn CommunicationChannel>) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            channel.read_exact(&mut byte).unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    #[test]
    fn test_turn_wraps_past_max() {
        assert_eq!(next_turn_angle(0), 45);
        assert_eq!(next_turn_angle(135), 180);
        assert_eq!(next_turn_angle(180), 0);
    }

    #[test]
    fn test_set_wraps_into_range() {
        assert_eq!(wrap_angle(90), 90);
        assert_eq!(wrap_angle(180), 180);
        assert_eq!(wrap_angle(200), 19);
        assert_eq!(wrap_angle(-1), 180);
    }

    #[test]
    fn test_device_answers_commands() {
        let device = SimulatedDevice::new();
        let mut channel = device.channel();

        channel.write_all(b"SET 90\nTURN\nIR?\n").unwrap();

        assert_eq!(read_line(&mut channel), "OK angle=90");
        assert_eq!(read_line(&mut channel), "OK angle=135");
        assert_eq!(read_line(&mut channel), "IR=LOW");
        assert_eq!(device.written_lines(), vec!["SET 90", "TURN", "IR?"]);
    }

    #[test]
    fn test_silent_device_records_but_does_not_answer() {
        let device = SimulatedDevice::new();
        device.set_silent(true);
        let mut channel = device.channel();
        channel.set_timeout(Duration::from_millis(10)).unwrap();

        channel.write_all(b"TURN\n").unwrap();

        let mut buf = [0u8; 8];
        let err = channel.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TimedOut);
        assert_eq!(device.written_lines(), vec!["TURN"]);
        assert_eq!(device.angle(), 0);
    }

    #[test]
    fn test_sensor_change_is_pushed() {
        let device = SimulatedDevice::new();
        let mut channel = device.channel();

        device.set_sensor(SensorState::High);

        assert_eq!(read_line(&mut channel), "IR:HIGH");
        assert_eq!(device.sensor(), SensorState::High);
    }

    #[test]
    fn test_preamble_precedes_reply() {
        let device = SimulatedDevice::new();
        let mut channel = device.channel();
        device.send_before_next_reply("IR:HIGH");

        channel.write_all(b"IR?\n").unwrap();

        assert_eq!(read_line(&mut channel), "IR:HIGH");
        assert_eq!(read_line(&mut channel), "IR=LOW");
    }

    #[test]
    fn test_lines_around_reply_keep_their_order() {
        let device = SimulatedDevice::new();
        let mut channel = device.channel();
        device.send_before_next_reply("IR:HIGH");
        device.send_after_next_reply("IR:LOW");

        channel.write_all(b"TURN\n").unwrap();

        assert_eq!(read_line(&mut channel), "IR:HIGH");
        assert_eq!(read_line(&mut channel), "OK angle=45");
        assert_eq!(read_line(&mut channel), "IR:LOW");
    }

    #[test]
    fn test_full_noise_always_flips() {
        let device = SimulatedDevice::new();
        device.set_noise(1.0);
        let mut channel = device.channel();

        channel.write_all(b"IR?\n").unwrap();

        assert_eq!(read_line(&mut channel), "IR=HIGH");
    }
}
