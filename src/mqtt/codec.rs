//! Motion command model and its wire encoding
//!
//! Grammar on the command topic:
//!
//! ```text
//! payload  := drive | "S"
//! drive    := dir "," speed "," duration
//! dir      := "F" | "B" | "L" | "R"
//! speed    := decimal in [0, 255]
//! duration := decimal in [0, MAX_DURATION_MS], 0 = until superseded
//! ```

use super::error::{CarLinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for a timed maneuver
pub const MAX_DURATION_MS: u32 = 10_000;

const STOP_PAYLOAD: &str = "S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heading {
    Forward,
    Backward,
    Left,
    Right,
}

impl Heading {
    pub const ALL: [Heading; 4] = [
        Heading::Forward,
        Heading::Backward,
        Heading::Left,
        Heading::Right,
    ];

    pub fn code(&self) -> char {
        match self {
            Heading::Forward => 'F',
            Heading::Backward => 'B',
            Heading::Left => 'L',
            Heading::Right => 'R',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "F" => Some(Heading::Forward),
            "B" => Some(Heading::Backward),
            "L" => Some(Heading::Left),
            "R" => Some(Heading::Right),
            _ => None,
        }
    }
}

/// Speed and duration of a directional command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Motion {
    speed: u8,
    duration_ms: u32,
}

impl Motion {
    pub fn new(speed: u8, duration_ms: u32) -> Result<Self> {
        if duration_ms > MAX_DURATION_MS {
            return Err(CarLinkError::InvalidCommand(format!(
                "duration {} ms exceeds {} ms",
                duration_ms, MAX_DURATION_MS
            )));
        }
        Ok(Self { speed, duration_ms })
    }

    /// Motion that lasts until the next command
    pub fn continuous(speed: u8) -> Self {
        Self {
            speed,
            duration_ms: 0,
        }
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }
}

/// Operator's slider values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Controls {
    pub speed: u32,
    pub duration_ms: u32,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            speed: 160,
            duration_ms: 300,
        }
    }
}

/// What the operator asked the vehicle to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maneuver {
    Drive(Heading),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Drive { heading: Heading, motion: Motion },
    Stop,
}

impl Command {
    pub fn drive(heading: Heading, speed: u8, duration_ms: u32) -> Result<Self> {
        Ok(Command::Drive {
            heading,
            motion: Motion::new(speed, duration_ms)?,
        })
    }

    /// Builds a command from slider values; Stop never looks at them
    pub fn from_controls(maneuver: Maneuver, controls: &Controls) -> Result<Self> {
        match maneuver {
            Maneuver::Stop => Ok(Command::Stop),
            Maneuver::Drive(heading) => {
                let speed = u8::try_from(controls.speed).map_err(|_| {
                    CarLinkError::InvalidCommand(format!(
                        "speed {} outside 0..=255",
                        controls.speed
                    ))
                })?;
                Command::drive(heading, speed, controls.duration_ms)
            }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Command::Drive { heading, motion } => format!(
                "{},{},{}",
                heading.code(),
                motion.speed,
                motion.duration_ms
            ),
            Command::Stop => STOP_PAYLOAD.to_string(),
        }
    }

    /// Parses a payload exactly as it appeared on the wire, without trimming
    pub fn decode(payload: &str) -> Result<Self> {
        if payload == STOP_PAYLOAD {
            return Ok(Command::Stop);
        }

        let fields: Vec<&str> = payload.split(',').collect();
        let [dir, speed, duration] = fields.as_slice() else {
            return Err(CarLinkError::DecodeError(format!(
                "expected 3 fields, got {} in {:?}",
                fields.len(),
                payload
            )));
        };

        let heading = Heading::from_code(dir).ok_or_else(|| {
            CarLinkError::DecodeError(format!("unknown direction {:?}", dir))
        })?;
        let speed = parse_number(speed, "speed")?;
        let duration = parse_number(duration, "duration")?;

        if !(0..=i64::from(u8::MAX)).contains(&speed) {
            return Err(CarLinkError::InvalidCommand(format!(
                "speed {} outside 0..=255",
                speed
            )));
        }
        if duration < 0 {
            return Err(CarLinkError::InvalidCommand(format!(
                "negative duration {}",
                duration
            )));
        }
        let duration = u32::try_from(duration).map_err(|_| {
            CarLinkError::InvalidCommand(format!("duration {} out of range", duration))
        })?;

        // Both bounds were checked above
        Command::drive(heading, speed as u8, duration)
    }

    /// Path and query for the HTTP peer interface
    pub fn http_path(&self) -> String {
        match self {
            Command::Drive { heading, motion } => format!(
                "/move?dir={}&speed={}&ms={}",
                heading.code(),
                motion.speed,
                motion.duration_ms
            ),
            Command::Stop => "/stop".to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Drive { heading, motion } => write!(
                f,
                "{:?} at {} for {} ms",
                heading, motion.speed, motion.duration_ms
            ),
            Command::Stop => write!(f, "Stop"),
        }
    }
}

/// ASCII decimal digits; a leading '-' is let through so range checks can name it
fn parse_number(field: &str, name: &str) -> Result<i64> {
    let digits = field.strip_prefix('-').unwrap_or(field);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CarLinkError::DecodeError(format!(
            "{} {:?} is not a decimal integer",
            name, field
        )));
    }
    field
        .parse::<i64>()
        .map_err(|_| CarLinkError::InvalidCommand(format!("{} {} out of range", name, field)))
}
