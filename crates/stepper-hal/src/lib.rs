//! # stepper-hal
//!
//! Hardware abstraction for the stepper controller.
//!
//! The bridge only ever talks to the [`RegisterLink`] trait, so the real
//! Modbus RTU link ([`ModbusRtuLink`]) and the headless simulator
//! ([`SimRegisterLink`]) are interchangeable.  [`HardwareProfile`] holds the
//! device's register map and knows how to decode its status word.

pub mod codec;
pub mod modbus;
pub mod profile;
pub mod register_link;
pub mod sim;

pub use modbus::{ModbusRtuLink, SerialSettings};
pub use profile::{ControlWrite, HardwareProfile, Opcodes, ProfileError};
pub use register_link::RegisterLink;
pub use sim::SimRegisterLink;
