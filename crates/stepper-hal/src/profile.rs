//! [`HardwareProfile`] – the register map of the stepper controller.
//!
//! Every address, opcode and status bit the bridge touches comes from the
//! profile, so a firmware revision with a different layout only needs a new
//! `[profile]` section in the configuration file.
//!
//! # Status word
//!
//! One status register covers every axis.  Each axis owns a six-bit cluster
//! starting at its entry in `status_offsets`:
//!
//! | bit | flag        |
//! |-----|-------------|
//! | +0  | `limit_neg` |
//! | +1  | `limit_pos` |
//! | +2  | `is_moving` |
//! | +3  | `is_done`   |
//! | +4  | `is_homed`  |
//! | +5  | `has_error` |
//!
//! The servo-mode flag lives at an independent bit per axis (`servo_bits`).

use serde::{Deserialize, Serialize};
use stepper_types::AxisState;
use thiserror::Error;

/// A literal value written to a single control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlWrite {
    pub address: u16,
    pub value: u16,
}

/// First word of every multi-word command frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Opcodes {
    pub home: u16,
    pub move_absolute: u16,
    pub move_relative: u16,
    pub servo_enable: u16,
    pub servo_disable: u16,
    pub servo_speed: u16,
}

impl Default for Opcodes {
    fn default() -> Self {
        Self {
            home: 0x0101,
            move_absolute: 0x0102,
            move_relative: 0x0103,
            servo_enable: 0x0201,
            servo_disable: 0x0202,
            servo_speed: 0x0203,
        }
    }
}

/// Errors detected when validating a profile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("axis_count must be at least 1")]
    NoAxes,

    #[error("{field} lists {actual} entries but axis_count is {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("status bit {bit} for axis {axis} does not fit a 16-bit register")]
    BitOutOfRange { axis: usize, bit: u8 },
}

/// The device's register map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareProfile {
    pub axis_count: u8,
    /// Start of every multi-word command frame.
    pub command_address: u16,
    pub status_address: u16,
    /// Bit offset of each axis's status cluster.
    pub status_offsets: Vec<u8>,
    /// Servo-mode bit of each axis.
    pub servo_bits: Vec<u8>,
    /// First (low-word) register of each axis's position.
    pub position_addresses: Vec<u16>,
    // Tables last so the TOML form keeps plain keys ahead of sub-tables.
    pub opcodes: Opcodes,
    pub stop: ControlWrite,
    pub enable: ControlWrite,
    pub disable: ControlWrite,
    pub reset: ControlWrite,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            axis_count: 2,
            command_address: 0x0000,
            opcodes: Opcodes::default(),
            stop: ControlWrite {
                address: 0x0000,
                value: 0,
            },
            enable: ControlWrite {
                address: 0x0004,
                value: 1,
            },
            disable: ControlWrite {
                address: 0x0004,
                value: 0,
            },
            reset: ControlWrite {
                address: 0x0005,
                value: 1,
            },
            status_address: 0x000D,
            status_offsets: vec![0, 8],
            servo_bits: vec![6, 14],
            position_addresses: vec![0x0011, 0x0013],
        }
    }
}

const CLUSTER_WIDTH: u8 = 6;

impl HardwareProfile {
    /// Check that the per-axis tables agree with `axis_count` and that every
    /// status bit lies inside the status word.
    pub fn validate(&self) -> Result<(), ProfileError> {
        let expected = usize::from(self.axis_count);
        if expected == 0 {
            return Err(ProfileError::NoAxes);
        }
        for (field, actual) in [
            ("status_offsets", self.status_offsets.len()),
            ("servo_bits", self.servo_bits.len()),
            ("position_addresses", self.position_addresses.len()),
        ] {
            if actual != expected {
                return Err(ProfileError::LengthMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }
        for (axis, &offset) in self.status_offsets.iter().enumerate() {
            if offset > 16 - CLUSTER_WIDTH {
                return Err(ProfileError::BitOutOfRange { axis, bit: offset });
            }
        }
        for (axis, &bit) in self.servo_bits.iter().enumerate() {
            if bit > 15 {
                return Err(ProfileError::BitOutOfRange { axis, bit });
            }
        }
        Ok(())
    }

    /// Decode the status word into one [`AxisState`] per axis.
    ///
    /// Positions are not part of the status word and are left at zero.
    pub fn decode_status(&self, word: u16) -> Vec<AxisState> {
        let bit = |base: u8, k: u8| {
            base.checked_add(k)
                .is_some_and(|n| n < 16 && word & (1u16 << n) != 0)
        };
        self.status_offsets
            .iter()
            .zip(&self.servo_bits)
            .map(|(&base, &servo)| AxisState {
                limit_neg: bit(base, 0),
                limit_pos: bit(base, 1),
                is_moving: bit(base, 2),
                is_done: bit(base, 3),
                is_homed: bit(base, 4),
                has_error: bit(base, 5),
                is_servo_mode: bit(servo, 0),
                position: 0,
            })
            .collect()
    }

    /// `(start, count)` of a single block read covering every position when
    /// the position registers are laid out back to back.
    pub fn position_block(&self) -> Option<(u16, u16)> {
        let first = *self.position_addresses.first()?;
        let contiguous = self
            .position_addresses
            .iter()
            .enumerate()
            .all(|(i, &addr)| u32::from(addr) == u32::from(first) + 2 * i as u32);
        let count = u16::try_from(self.position_addresses.len() * 2).ok()?;
        contiguous.then_some((first, count))
    }
}
