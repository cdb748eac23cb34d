//! The register transport seam.
//!
//! A [`RegisterLink`] is a persistent request/response connection to one
//! addressable device.  Framing and checksums belong to the implementation.
//! Callers see whole register transactions that either complete or fail.

use async_trait::async_trait;
use stepper_types::StepperError;

/// Point-to-point holding-register access to one device.
///
/// Every method takes `&mut self`: a link is owned by exactly one caller at a
/// time, so two transactions can never be in flight on the same link.
///
/// # Errors
///
/// * [`StepperError::NotConnected`] when called before `connect`.
/// * [`StepperError::Transport`] on timeouts and I/O failures.
/// * [`StepperError::DeviceException`] when the device answers with a
///   protocol exception.
#[async_trait]
pub trait RegisterLink: Send {
    /// Human-readable endpoint, e.g. `/dev/ttyUSB0@9600#1`.
    fn endpoint(&self) -> String;

    /// Open the link.  Succeeds immediately when already open.
    async fn connect(&mut self) -> Result<(), StepperError>;

    /// Close the link.  Safe to call when already closed.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read `count` consecutive holding registers starting at `address`.
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, StepperError>;

    /// Write `values` to consecutive holding registers starting at `address`.
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), StepperError>;

    /// Write one holding register.
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), StepperError>;

    /// Health check: a one-register read at address 0.
    async fn probe(&mut self) -> Result<(), StepperError> {
        self.read_registers(0, 1).await.map(|_| ())
    }
}
