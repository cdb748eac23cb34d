use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Command payloads
// ────────────────────────────────────────────────────────────────────────────

fn default_move_speed() -> u16 {
    1000
}
fn default_acceleration() -> u16 {
    1000
}
fn default_deceleration() -> u16 {
    1000
}
fn default_home_direction() -> i16 {
    1
}
fn default_home_speed() -> u16 {
    500
}
fn default_servo_max_speed() -> u16 {
    5000
}

/// Payload of `axis/{n}/move/absolute`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsoluteMove {
    /// Target position in device steps.
    pub position: i32,
    /// Cruise speed in steps per second.
    #[serde(default = "default_move_speed")]
    pub speed: u16,
    /// Ramp-up rate in steps per second squared.
    #[serde(default = "default_acceleration")]
    pub acceleration: u16,
    /// Ramp-down rate in steps per second squared.
    #[serde(default = "default_deceleration")]
    pub deceleration: u16,
}

/// Payload of `axis/{n}/move/relative`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeMove {
    /// Signed distance in device steps from the current position.
    pub distance: i32,
    /// Cruise speed in steps per second.
    #[serde(default = "default_move_speed")]
    pub speed: u16,
    /// Ramp-up rate in steps per second squared.
    #[serde(default = "default_acceleration")]
    pub acceleration: u16,
    /// Ramp-down rate in steps per second squared.
    #[serde(default = "default_deceleration")]
    pub deceleration: u16,
}

/// Payload of `axis/{n}/home`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Home {
    /// `1` seeks the positive limit, `-1` the negative one.
    #[serde(default = "default_home_direction")]
    pub direction: i16,
    /// Seek speed in steps per second.
    #[serde(default = "default_home_speed")]
    pub speed: u16,
}

impl Default for Home {
    fn default() -> Self {
        Self {
            direction: default_home_direction(),
            speed: default_home_speed(),
        }
    }
}

/// Payload of `axis/{n}/enable_servo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoEnable {
    /// Speed ceiling while in servo mode.
    #[serde(default = "default_servo_max_speed")]
    pub max_speed: u16,
    /// Ramp rate applied to speed changes.
    #[serde(default = "default_acceleration")]
    pub acceleration: u16,
}

impl Default for ServoEnable {
    fn default() -> Self {
        Self {
            max_speed: default_servo_max_speed(),
            acceleration: default_acceleration(),
        }
    }
}

/// Payload of `axis/{n}/servo_speed`.
///
/// Supervisors send the speed as an integer, a float or a numeric string.
/// Fractional values are truncated toward zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoSpeed {
    /// Signed target speed; the sign selects the direction.
    #[serde(deserialize_with = "deserialize_lenient_i16")]
    pub speed: i16,
}

fn deserialize_lenient_i16<'de, D>(deserializer: D) -> Result<i16, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i16::try_from(i)
                .map_err(|_| de::Error::custom(format!("speed {i} does not fit a 16-bit register"))),
            None => truncate_to_i16(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return i16::try_from(i).map_err(|_| {
                    de::Error::custom(format!("speed {i} does not fit a 16-bit register"))
                });
            }
            let parsed = trimmed
                .parse::<f64>()
                .map_err(|_| de::Error::custom(format!("invalid speed value: {s:?}")))?;
            truncate_to_i16(parsed)
        }
        other => Err(de::Error::custom(format!(
            "speed must be a number or numeric string, got {other}"
        ))),
    }
}

fn truncate_to_i16<E: de::Error>(raw: f64) -> Result<i16, E> {
    if !raw.is_finite() {
        return Err(E::custom(format!("invalid speed value: {raw}")));
    }
    let truncated = raw.trunc();
    if truncated < f64::from(i16::MIN) || truncated > f64::from(i16::MAX) {
        return Err(E::custom(format!(
            "speed {truncated} does not fit a 16-bit register"
        )));
    }
    Ok(truncated as i16)
}

/// The closed set of actions the bridge understands.
///
/// Each variant carries its own typed parameters with defaults already
/// applied, so dispatch never looks at raw payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    MoveAbsolute(AbsoluteMove),
    MoveRelative(RelativeMove),
    Home(Home),
    Stop,
    Enable,
    Disable,
    Reset,
    EnableServo(ServoEnable),
    DisableServo,
    ServoSpeed(ServoSpeed),
}

impl Action {
    /// Name reported in the `command` field of the acknowledgment.
    pub fn ack_name(&self) -> &'static str {
        match self {
            Action::MoveAbsolute(_) => "move_absolute",
            Action::MoveRelative(_) => "move_relative",
            Action::Home(_) => "home",
            Action::Stop => "stop",
            Action::Enable => "enable",
            Action::Disable => "disable",
            Action::Reset => "reset",
            Action::EnableServo(_) => "enable_servo_mode",
            Action::DisableServo => "disable_servo_mode",
            Action::ServoSpeed(_) => "set_servo_speed",
        }
    }

    /// Parameters echoed back in the acknowledgment, with defaults filled in.
    pub fn params(&self) -> Option<Value> {
        let value = match self {
            Action::MoveAbsolute(p) => serde_json::to_value(p),
            Action::MoveRelative(p) => serde_json::to_value(p),
            Action::Home(p) => serde_json::to_value(p),
            Action::EnableServo(p) => serde_json::to_value(p),
            Action::ServoSpeed(p) => serde_json::to_value(p),
            Action::Stop | Action::Enable | Action::Disable | Action::Reset | Action::DisableServo => {
                return None;
            }
        };
        value.ok()
    }
}

/// A parsed inbound command.  Created per message and discarded once its
/// acknowledgment has been published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub device_id: u8,
    /// `None` addresses every axis of the device.
    pub axis_id: Option<u8>,
    pub action: Action,
}

/// Decoded status of one axis as of the most recent successful poll.
///
/// The position is published on its own topic, so it is left out of the
/// serialized status document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisState {
    pub limit_neg: bool,
    pub limit_pos: bool,
    pub is_moving: bool,
    pub is_done: bool,
    pub is_homed: bool,
    pub has_error: bool,
    pub is_servo_mode: bool,
    #[serde(skip_serializing, default)]
    pub position: i32,
}

/// Link-level health of the device behind the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: u8,
    pub connected: bool,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    /// Initial status before the first poll: disconnected, no error.
    pub fn new(device_id: u8) -> Self {
        Self {
            device_id,
            connected: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Completion event published after every dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Ack {
    pub fn for_action(action: &Action, success: bool) -> Self {
        Self {
            command: action.ack_name().to_string(),
            success,
            params: action.params(),
        }
    }
}

/// Error type shared by the transport traits and the bridge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepperError {
    #[error("Register transport error: {0}")]
    Transport(String),

    #[error("Device exception at register {address:#06x}: {details}")]
    DeviceException { address: u16, details: String },

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Connection to {endpoint} failed: {details}")]
    Connection { endpoint: String, details: String },

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

impl StepperError {
    /// `true` when the error means the register link itself is unusable and
    /// must be re-established.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, StepperError::Transport(_) | StepperError::NotConnected(_))
    }
}
