//! Line decoding
//!
//! Turns the byte stream coming from the board into trimmed text lines. The
//! firmware is mostly ASCII but boot noise and baud mismatches produce garbage,
//! so invalid bytes are dropped and decoding never fails.

use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tracing::trace;

use super::stream::CommunicationChannel;

/// Lines longer than this without a terminator are flushed as-is
pub const MAX_LINE_LEN: usize = 1024;

/// Ceiling for any single wait, whatever the caller asked for
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + budget`, clamped so huge budgets neither overflow nor wait forever
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget.min(MAX_WAIT)).unwrap_or(now)
}

/// Reads newline-terminated lines with a bounded wait
pub struct LineReader {
    channel: Box<dyn CommunicationChannel>,
    read_timeout: Duration,
    /// Bytes received after the last newline
    pending: Vec<u8>,
}

impl LineReader {
    /// Reader with an empty fragment buffer
    pub fn new(channel: Box<dyn CommunicationChannel>, read_timeout: Duration) -> Self {
        Self {
            channel,
            read_timeout,
            pending: Vec::new(),
        }
    }

    /// Per-attempt read timeout
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Attempt to read one line, waiting at most the read timeout
    ///
    /// Returns `None` on timeout, read error, end of stream, or a blank line.
    pub fn try_read_line(&mut self) -> Option<String> {
        self.read_line_within(self.read_timeout)
    }

    /// Like [`try_read_line`](Self::try_read_line), but never waits longer than `budget`
    pub fn read_line_within(&mut self, budget: Duration) -> Option<String> {
        let deadline = deadline_after(budget.min(self.read_timeout));
        let mut chunk = [0u8; 256];

        loop {
            if let Some(raw) = self.take_buffered_line() {
                return decode(&raw);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // A failed timeout update leaves the previous one in place, which is still bounded
            let _ = self.channel.set_timeout(remaining);

            match self.channel.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    return None
                }
                Err(e) => {
                    trace!("read error treated as no data: {}", e);
                    return None;
                }
            }
        }
    }

    fn take_buffered_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            return Some(line);
        }
        if self.pending.len() >= MAX_LINE_LEN {
            return Some(std::mem::take(&mut self.pending));
        }
        None
    }
}

fn decode(raw: &[u8]) -> Option<String> {
    // A stray byte in front of `IR:HIGH` must not hide the prefix
    let text: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|&c| c != char::REPLACEMENT_CHARACTER)
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
