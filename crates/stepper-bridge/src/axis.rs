//! [`AxisController`] – executes commands for one axis.
//!
//! Each action becomes exactly one register transaction:
//!
//! * motion and servo actions write a frame at the profile's command address,
//!   `[opcode, axis, params...]`;
//! * stop / enable / disable / reset write one literal value to a control
//!   register.
//!
//! The outcome is acknowledged on `.../axis/{axis}/ack` once the lock has
//! been released.

use std::sync::Arc;

use stepper_hal::ControlWrite;
use stepper_hal::codec::{i16_word, split_i32};
use stepper_types::{Ack, Action, StepperError};
use tracing::{debug, error, warn};

use crate::shared::Shared;

/// The register transaction an action maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Multi-register write.
    Words { address: u16, words: Vec<u16> },
    /// Single-register write.
    Control(ControlWrite),
}

/// Turns [`Action`]s for one axis into register writes and acknowledges
/// each one on `…/axis/{n}/ack`.
///
/// Holds no lock of its own; every write goes through the bridge's shared
/// hardware guard.
#[derive(Clone)]
pub struct AxisController {
    axis_id: u8,
    shared: Arc<Shared>,
}

impl AxisController {
    pub(crate) fn new(axis_id: u8, shared: Arc<Shared>) -> Self {
        Self { axis_id, shared }
    }

    /// Build the register frame for `action` on this axis.
    pub fn frame(&self, action: &Action) -> Frame {
        let profile = &self.shared.profile;
        let op = &profile.opcodes;
        let axis = u16::from(self.axis_id);
        let words = match action {
            Action::MoveAbsolute(m) => {
                let [lo, hi] = split_i32(m.position);
                vec![
                    op.move_absolute,
                    axis,
                    lo,
                    hi,
                    0,
                    0,
                    m.speed,
                    m.acceleration,
                    m.deceleration,
                ]
            }
            Action::MoveRelative(m) => {
                let [lo, hi] = split_i32(m.distance);
                vec![
                    op.move_relative,
                    axis,
                    lo,
                    hi,
                    0,
                    0,
                    m.speed,
                    m.acceleration,
                    m.deceleration,
                ]
            }
            Action::Home(h) => vec![op.home, axis, i16_word(h.direction), h.speed],
            Action::EnableServo(s) => vec![op.servo_enable, axis, s.max_speed, s.acceleration],
            Action::DisableServo => vec![op.servo_disable, axis],
            Action::ServoSpeed(s) => vec![op.servo_speed, axis, i16_word(s.speed)],
            Action::Stop => return Frame::Control(profile.stop),
            Action::Enable => return Frame::Control(profile.enable),
            Action::Disable => return Frame::Control(profile.disable),
            Action::Reset => return Frame::Control(profile.reset),
        };
        Frame::Words {
            address: profile.command_address,
            words,
        }
    }

    /// Run `action` and publish its acknowledgment.
    pub async fn execute(&self, action: &Action) -> Result<(), StepperError> {
        let frame = self.frame(action);
        let result = {
            let mut hw = self.shared.hardware.lock().await;
            let result = match &frame {
                Frame::Words { address, words } => hw.link.write_registers(*address, words).await,
                Frame::Control(w) => hw.link.write_register(w.address, w.value).await,
            };
            if let Err(e) = &result {
                if e.is_link_failure() {
                    hw.link_down = true;
                }
            }
            result
        };

        match &result {
            Ok(()) => debug!(axis = self.axis_id, command = action.ack_name(), ?frame, "command written"),
            Err(e) if e.is_link_failure() => {
                error!(axis = self.axis_id, command = action.ack_name(), error = %e, "command write failed")
            }
            Err(e) => warn!(axis = self.axis_id, command = action.ack_name(), error = %e, "device rejected command"),
        }

        let ack = Ack::for_action(action, result.is_ok());
        let topic = self.shared.topics.axis(self.axis_id, "ack");
        self.shared.publish_json(&topic, &ack).await;
        result
    }
}
