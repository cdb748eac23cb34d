//! [`CommandRouter`] – turns inbound `(topic, payload)` pairs into
//! [`Command`]s.
//!
//! Accepted topic shapes:
//!
//! ```text
//! {root}/{device}/axis/{axis}/{action}[/{subaction}]
//! {root}/{device}/{enable|disable|reset}
//! ```
//!
//! `{device}` is either the bare id (`1`) or the published form
//! (`stepper1`).  Commands for any other device are ignored, not rejected.
//! Payloads are JSON objects; an empty payload counts as `{}`.

use serde::de::DeserializeOwned;
use serde_json::Value;
use stepper_types::{Action, Command};
use thiserror::Error;

/// Every axis-level action suffix the router understands.
const AXIS_ACTIONS: [&str; 10] = [
    "move/absolute",
    "move/relative",
    "home",
    "stop",
    "enable",
    "disable",
    "reset",
    "enable_servo",
    "disable_servo",
    "servo_speed",
];

/// Actions that may address the device as a whole.
const DEVICE_ACTIONS: [&str; 3] = ["enable", "disable", "reset"];

/// Why an inbound message could not be turned into a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("topic '{0}' has fewer than 3 segments")]
    TooFewSegments(String),

    #[error("topic root '{found}' does not match '{expected}'")]
    UnexpectedRoot { expected: String, found: String },

    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    #[error("axis id '{0}' is not an integer")]
    InvalidAxis(String),

    #[error("axis {axis} out of range; device has {count} axes")]
    AxisOutOfRange { axis: i64, count: u8 },

    #[error("invalid payload for '{action}': {details}")]
    InvalidPayload { action: String, details: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Command(Command),
    /// Well-formed, but addressed to another device.
    Ignored { device: String },
}

/// Parser bound to one device id and topic root.
#[derive(Debug, Clone)]
pub struct CommandRouter {
    root: String,
    device_id: u8,
    axis_count: u8,
}

impl CommandRouter {
    pub fn new(root: impl Into<String>, device_id: u8, axis_count: u8) -> Self {
        Self {
            root: root.into(),
            device_id,
            axis_count,
        }
    }

    /// The MQTT filters the bridge subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let axis = AXIS_ACTIONS
            .iter()
            .map(|action| format!("{}/+/axis/+/{action}", self.root));
        let device = DEVICE_ACTIONS
            .iter()
            .map(|action| format!("{}/+/{action}", self.root));
        axis.chain(device).collect()
    }

    /// Parse one inbound message.
    ///
    /// The topic is checked before the payload, so a message for a foreign
    /// device is ignored even when its payload is garbage.
    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Routed, ParseError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < 3 {
            return Err(ParseError::TooFewSegments(topic.to_string()));
        }
        if segments[0] != self.root {
            return Err(ParseError::UnexpectedRoot {
                expected: self.root.clone(),
                found: segments[0].to_string(),
            });
        }
        let device = segments[1];
        if parse_device(device) != Some(self.device_id) {
            return Ok(Routed::Ignored {
                device: device.to_string(),
            });
        }

        let (axis_id, action) = if segments.len() == 3 {
            (None, segments[2].to_string())
        } else {
            if segments[2] != "axis" || segments.len() < 5 {
                return Err(ParseError::MalformedTopic(topic.to_string()));
            }
            let axis = self.parse_axis(segments[3])?;
            (Some(axis), segments[4..].join("/"))
        };

        let params = parse_payload(&action, payload)?;
        let action = match axis_id {
            Some(_) => axis_action(&action, params)?,
            None => device_action(&action)?,
        };
        Ok(Routed::Command(Command {
            device_id: self.device_id,
            axis_id,
            action,
        }))
    }

    fn parse_axis(&self, segment: &str) -> Result<u8, ParseError> {
        let digits = segment.strip_prefix('-').unwrap_or(segment);
        if !is_digits(digits) {
            return Err(ParseError::InvalidAxis(segment.to_string()));
        }
        let axis: i64 = segment
            .parse()
            .map_err(|_| ParseError::InvalidAxis(segment.to_string()))?;
        u8::try_from(axis)
            .ok()
            .filter(|a| *a < self.axis_count)
            .ok_or(ParseError::AxisOutOfRange {
                axis,
                count: self.axis_count,
            })
    }
}

fn parse_device(segment: &str) -> Option<u8> {
    let digits = segment.strip_prefix("stepper").unwrap_or(segment);
    is_digits(digits).then(|| digits.parse().ok()).flatten()
}

/// `str::parse` also takes a leading `+`; topic ids are plain digits.
fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_payload(action: &str, payload: &[u8]) -> Result<Value, ParseError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(payload).map_err(|e| ParseError::InvalidPayload {
        action: action.to_string(),
        details: e.to_string(),
    })
}

fn typed<T: DeserializeOwned>(action: &str, params: Value) -> Result<T, ParseError> {
    serde_json::from_value(params).map_err(|e| ParseError::InvalidPayload {
        action: action.to_string(),
        details: e.to_string(),
    })
}

fn axis_action(name: &str, params: Value) -> Result<Action, ParseError> {
    Ok(match name {
        "move/absolute" => Action::MoveAbsolute(typed(name, params)?),
        "move/relative" => Action::MoveRelative(typed(name, params)?),
        "home" => Action::Home(typed(name, params)?),
        "stop" => Action::Stop,
        "enable" => Action::Enable,
        "disable" => Action::Disable,
        "reset" => Action::Reset,
        "enable_servo" => Action::EnableServo(typed(name, params)?),
        "disable_servo" => Action::DisableServo,
        "servo_speed" => Action::ServoSpeed(typed(name, params)?),
        other => return Err(ParseError::UnknownAction(other.to_string())),
    })
}

fn device_action(name: &str) -> Result<Action, ParseError> {
    match name {
        "enable" => Ok(Action::Enable),
        "disable" => Ok(Action::Disable),
        "reset" => Ok(Action::Reset),
        other => Err(ParseError::UnknownAction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepper_types::{AbsoluteMove, Home, ServoSpeed};

    fn router() -> CommandRouter {
        CommandRouter::new("stepper", 1, 2)
    }

    fn command(routed: Routed) -> Command {
        match routed {
            Routed::Command(c) => c,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn absolute_move_with_defaults() {
        let c = command(
            router()
                .route("stepper/1/axis/0/move/absolute", br#"{"position":1000,"speed":500}"#)
                .unwrap(),
        );
        assert_eq!(c.device_id, 1);
        assert_eq!(c.axis_id, Some(0));
        assert_eq!(
            c.action,
            Action::MoveAbsolute(AbsoluteMove {
                position: 1000,
                speed: 500,
                acceleration: 1000,
                deceleration: 1000,
            })
        );
    }

    #[test]
    fn published_device_form_is_accepted() {
        let c = command(router().route("stepper/stepper1/axis/1/home", b"").unwrap());
        assert_eq!(c.axis_id, Some(1));
        assert_eq!(c.action, Action::Home(Home::default()));
    }

    #[test]
    fn device_level_topics() {
        for (topic, action) in [
            ("stepper/1/enable", Action::Enable),
            ("stepper/1/disable", Action::Disable),
            ("stepper/1/reset", Action::Reset),
        ] {
            let c = command(router().route(topic, b"{}").unwrap());
            assert_eq!(c.axis_id, None);
            assert_eq!(c.action, action);
        }
        assert_eq!(
            router().route("stepper/1/stop", b""),
            Err(ParseError::UnknownAction("stop".into()))
        );
    }

    #[test]
    fn fewer_than_three_segments_always_fails() {
        for topic in ["", "stepper", "stepper/1", "a/b"] {
            assert!(
                matches!(router().route(topic, b"{}"), Err(ParseError::TooFewSegments(_))),
                "topic {topic:?}"
            );
        }
    }

    #[test]
    fn foreign_devices_are_ignored() {
        for topic in [
            "stepper/2/axis/0/stop",
            "stepper/stepper7/enable",
            "stepper/abc/axis/0/stop",
            "stepper/2/axis/0/move/absolute",
        ] {
            assert!(
                matches!(router().route(topic, b"not json"), Ok(Routed::Ignored { .. })),
                "topic {topic:?}"
            );
        }
    }

    #[test]
    fn topic_shape_errors() {
        let r = router();
        assert!(matches!(
            r.route("other/1/axis/0/stop", b""),
            Err(ParseError::UnexpectedRoot { .. })
        ));
        assert!(matches!(
            r.route("stepper/1/motor/0/stop", b""),
            Err(ParseError::MalformedTopic(_))
        ));
        assert!(matches!(
            r.route("stepper/1/axis/0", b""),
            Err(ParseError::MalformedTopic(_))
        ));
        assert_eq!(
            r.route("stepper/1/axis/x/stop", b""),
            Err(ParseError::InvalidAxis("x".into()))
        );
        assert_eq!(
            r.route("stepper/1/axis/2/stop", b""),
            Err(ParseError::AxisOutOfRange { axis: 2, count: 2 })
        );
        assert_eq!(
            r.route("stepper/1/axis/-1/stop", b""),
            Err(ParseError::AxisOutOfRange { axis: -1, count: 2 })
        );
        assert_eq!(
            r.route("stepper/1/axis/0/jog", b""),
            Err(ParseError::UnknownAction("jog".into()))
        );
        assert_eq!(
            r.route("stepper/1/axis/0/move/sideways", b""),
            Err(ParseError::UnknownAction("move/sideways".into()))
        );
    }

    #[test]
    fn payload_errors() {
        let r = router();
        assert!(matches!(
            r.route("stepper/1/axis/0/stop", b"{not json"),
            Err(ParseError::InvalidPayload { .. })
        ));
        assert!(matches!(
            r.route("stepper/1/axis/0/move/absolute", b"{}"),
            Err(ParseError::InvalidPayload { .. })
        ));
        assert!(matches!(
            r.route("stepper/1/axis/0/move/relative", br#"{"distance":1,"speed":70000}"#),
            Err(ParseError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn servo_speed_coercion() {
        let r = router();
        let c = command(
            r.route("stepper/1/axis/0/servo_speed", br#"{"speed":"12.7"}"#)
                .unwrap(),
        );
        assert_eq!(c.action, Action::ServoSpeed(ServoSpeed { speed: 12 }));
        assert!(matches!(
            r.route("stepper/1/axis/0/servo_speed", br#"{"speed":"abc"}"#),
            Err(ParseError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn subscriptions_cover_every_action() {
        let subs = router().subscriptions();
        assert_eq!(subs.len(), 13);
        assert!(subs.contains(&"stepper/+/axis/+/move/absolute".to_string()));
        assert!(subs.contains(&"stepper/+/axis/+/servo_speed".to_string()));
        assert!(subs.contains(&"stepper/+/reset".to_string()));
    }

    #[test]
    fn signed_ids_are_not_plain_digits() {
        let r = router();
        assert_eq!(
            r.route("stepper/+1/axis/0/stop", b""),
            Ok(Routed::Ignored {
                device: "+1".into()
            })
        );
        assert_eq!(
            r.route("stepper/stepper+1/enable", b""),
            Ok(Routed::Ignored {
                device: "stepper+1".into()
            })
        );
        assert_eq!(
            r.route("stepper/1/axis/+0/stop", b""),
            Err(ParseError::InvalidAxis("+0".into()))
        );
        assert!(matches!(
            r.route("stepper/01/axis/0/stop", b""),
            Ok(Routed::Command(_))
        ));
    }
}
