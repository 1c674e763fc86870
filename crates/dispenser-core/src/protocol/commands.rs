//! Protocol commands
//!
//! Defines the line grammar spoken by the dispenser firmware.
//!
//! Replies and push events share the `IR` marker and differ only in the
//! separator: `IR=` answers an `IR?` query, `IR:` is sent unprompted when the
//! beam changes. Existing firmware depends on this, so it is kept as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of the reply to `TURN` and `SET`
pub const MOVE_REPLY_PREFIX: &str = "OK angle=";

/// Prefix of the reply to `IR?`
pub const SENSOR_REPLY_PREFIX: &str = "IR=";

/// Prefix of an unsolicited sensor change
pub const SENSOR_PUSH_PREFIX: &str = "IR:";

/// IR beam reading reported by the dispenser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum SensorState {
    /// No reading has been observed yet
    #[default]
    Unknown = 0,
    /// Beam blocked: a pill sits in the tray
    Low = 1,
    /// Beam clear: the tray is empty
    High = 2,
}

impl SensorState {
    /// Parse the wire token (`LOW` / `HIGH`), ignoring surrounding whitespace
    pub fn from_wire(token: &str) -> Option<Self> {
        match token.trim() {
            "LOW" => Some(SensorState::Low),
            "HIGH" => Some(SensorState::High),
            _ => None,
        }
    }

    /// Wire token for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorState::Unknown => "UNKNOWN",
            SensorState::Low => "LOW",
            SensorState::High => "HIGH",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SensorState::Low,
            2 => SensorState::High,
            _ => SensorState::Unknown,
        }
    }

    /// Whether a real reading is known
    pub fn is_known(&self) -> bool {
        *self != SensorState::Unknown
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "UNKNOWN" => Ok(SensorState::Unknown),
            other => SensorState::from_wire(other)
                .ok_or_else(|| format!("Unknown sensor state '{}'", other)),
        }
    }
}

/// Commands understood by the dispenser firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Advance the carousel by its fixed increment (`TURN`)
    Turn,

    /// Move the servo to an absolute angle (`SET <angle>`)
    ///
    /// The angle is sent verbatim; the firmware decides how out-of-range
    /// values wrap.
    SetAngle(i32),

    /// Ask for the current IR reading (`IR?`)
    QuerySensor,
}

impl Command {
    /// Text of the command without the line terminator
    pub fn text(&self) -> String {
        match self {
            Command::Turn => "TURN".to_string(),
            Command::SetAngle(angle) => format!("SET {}", angle),
            Command::QuerySensor => "IR?".to_string(),
        }
    }

    /// Convert command to bytes, appending newline for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.push(b'\n');
        bytes
    }

    /// Prefix of the line that completes this command
    pub fn reply_prefix(&self) -> &'static str {
        match self {
            Command::Turn | Command::SetAngle(_) => MOVE_REPLY_PREFIX,
            Command::QuerySensor => SENSOR_REPLY_PREFIX,
        }
    }
}

/// A decoded line from the dispenser, classified by its prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    /// `OK angle=<int>`; `None` if the angle did not parse
    MoveAck(Option<i32>),
    /// `IR=<state>`: answer to a sensor query
    SensorReply(SensorState),
    /// `IR:<state>`: the sensor changed on its own
    SensorPush(SensorState),
    /// Boot banner, debug output, malformed lines
    Unrecognized,
}

impl InboundLine {
    /// Classify a trimmed line
    pub fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix(SENSOR_REPLY_PREFIX) {
            return SensorState::from_wire(rest)
                .map(InboundLine::SensorReply)
                .unwrap_or(InboundLine::Unrecognized);
        }
        if let Some(rest) = line.strip_prefix(SENSOR_PUSH_PREFIX) {
            return SensorState::from_wire(rest)
                .map(InboundLine::SensorPush)
                .unwrap_or(InboundLine::Unrecognized);
        }
        if let Some(rest) = line.strip_prefix(MOVE_REPLY_PREFIX) {
            return InboundLine::MoveAck(parse_angle(rest));
        }
        InboundLine::Unrecognized
    }
}

/// Parse the integer after `OK angle=`
pub fn parse_angle(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::Turn.to_bytes(), b"TURN\n".to_vec());
        assert_eq!(Command::SetAngle(90).to_bytes(), b"SET 90\n".to_vec());
        assert_eq!(Command::SetAngle(-5).to_bytes(), b"SET -5\n".to_vec());
        assert_eq!(Command::QuerySensor.to_bytes(), b"IR?\n".to_vec());
    }

    #[test]
    fn test_out_of_range_angle_is_sent_verbatim() {
        assert_eq!(Command::SetAngle(200).text(), "SET 200");
    }

    #[test]
    fn test_reply_prefixes() {
        assert_eq!(Command::Turn.reply_prefix(), "OK angle=");
        assert_eq!(Command::SetAngle(10).reply_prefix(), "OK angle=");
        assert_eq!(Command::QuerySensor.reply_prefix(), "IR=");
    }

    #[test]
    fn test_classify_lines() {
        assert_eq!(InboundLine::parse("OK angle=45"), InboundLine::MoveAck(Some(45)));
        assert_eq!(InboundLine::parse("OK angle=abc"), InboundLine::MoveAck(None));
        assert_eq!(
            InboundLine::parse("IR=LOW"),
            InboundLine::SensorReply(SensorState::Low)
        );
        assert_eq!(
            InboundLine::parse("IR:HIGH"),
            InboundLine::SensorPush(SensorState::High)
        );
        assert_eq!(
            InboundLine::parse("IR: HIGH "),
            InboundLine::SensorPush(SensorState::High)
        );
        assert_eq!(InboundLine::parse("READY"), InboundLine::Unrecognized);
    }

    #[test]
    fn test_malformed_sensor_lines_are_ignored() {
        assert_eq!(InboundLine::parse("IR"), InboundLine::Unrecognized);
        assert_eq!(InboundLine::parse("IR=MAYBE"), InboundLine::Unrecognized);
        assert_eq!(InboundLine::parse("IR:"), InboundLine::Unrecognized);
        assert_eq!(InboundLine::parse("IR?"), InboundLine::Unrecognized);
    }

    #[test]
    fn test_sensor_state_round_trip_through_u8() {
        for state in [SensorState::Unknown, SensorState::Low, SensorState::High] {
            assert_eq!(SensorState::from_u8(state as u8), state);
        }
        assert_eq!(SensorState::from_u8(200), SensorState::Unknown);
    }

    #[test]
    fn test_sensor_state_from_str() {
        assert_eq!("HIGH".parse::<SensorState>(), Ok(SensorState::High));
        assert_eq!("UNKNOWN".parse::<SensorState>(), Ok(SensorState::Unknown));
        assert!("high".parse::<SensorState>().is_err());
    }

    #[test]
    fn test_sensor_state_serialization() {
        let json = serde_json::to_string(&SensorState::Low).unwrap();
        assert_eq!(json, "\"LOW\"");
        let state: SensorState = serde_json::from_str("\"HIGH\"").unwrap();
        assert_eq!(state, SensorState::High);
    }
}
