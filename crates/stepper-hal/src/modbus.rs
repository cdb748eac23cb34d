//! Modbus RTU implementation of [`RegisterLink`].
//!
//! The serial port is opened with `tokio-serial` (8N1, no flow control) and
//! wrapped in a `tokio-modbus` RTU client context addressed at one slave id.
//! Every transaction runs under the configured timeout.  A timeout or I/O
//! failure closes the port so the next [`connect`][RegisterLink::connect]
//! starts from a clean line.

use std::time::Duration;

use async_trait::async_trait;
use stepper_types::StepperError;
use tokio::time::error::Elapsed;
use tokio_modbus::client::{Context, Reader, Writer, rtu};
use tokio_modbus::{Exception, Slave};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::register_link::RegisterLink;

/// Serial line parameters for one Modbus slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Modbus slave address of the controller.
    pub device_id: u8,
    /// Per-transaction response timeout.
    pub timeout: Duration,
}

/// Production register link over a serial Modbus RTU bus.
pub struct ModbusRtuLink {
    settings: SerialSettings,
    ctx: Option<Context>,
}

type ModbusOutcome<T> = Result<tokio_modbus::Result<T>, Elapsed>;

impl ModbusRtuLink {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            ctx: None,
        }
    }

    fn context(&mut self) -> Result<&mut Context, StepperError> {
        let endpoint = self.endpoint();
        self.ctx.as_mut().ok_or(StepperError::NotConnected(endpoint))
    }

    fn settle<T>(&mut self, address: u16, outcome: ModbusOutcome<T>) -> Result<T, StepperError> {
        match outcome {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(exception_error(address, exception)),
            Ok(Err(e)) => {
                self.ctx = None;
                Err(StepperError::Transport(format!(
                    "{} at register {address:#06x}: {e}",
                    self.endpoint()
                )))
            }
            Err(_) => {
                self.ctx = None;
                Err(StepperError::Transport(format!(
                    "{} at register {address:#06x}: no response within {:?}",
                    self.endpoint(),
                    self.settings.timeout
                )))
            }
        }
    }
}

fn exception_error(address: u16, exception: Exception) -> StepperError {
    StepperError::DeviceException {
        address,
        details: format!("{exception:?}"),
    }
}

#[async_trait]
impl RegisterLink for ModbusRtuLink {
    fn endpoint(&self) -> String {
        format!(
            "{}@{}#{}",
            self.settings.port, self.settings.baud_rate, self.settings.device_id
        )
    }

    async fn connect(&mut self) -> Result<(), StepperError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let port = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| StepperError::Connection {
                endpoint: self.endpoint(),
                details: e.to_string(),
            })?;
        self.ctx = Some(rtu::attach_slave(port, Slave(self.settings.device_id)));
        info!(endpoint = %self.endpoint(), "Modbus RTU link open");
        Ok(())
    }

    async fn disconnect(&mut self) {
        // Dropping the context closes the serial port.
        if self.ctx.take().is_some() {
            info!(endpoint = %self.endpoint(), "Modbus RTU link closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, StepperError> {
        let timeout = self.settings.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.read_holding_registers(address, count)).await;
        let words = self.settle(address, outcome)?;
        if words.len() != usize::from(count) {
            warn!(address, expected = count, got = words.len(), "short register read");
            return Err(StepperError::Transport(format!(
                "expected {count} registers at {address:#06x}, got {}",
                words.len()
            )));
        }
        debug!(address, ?words, "read registers");
        Ok(words)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), StepperError> {
        let timeout = self.settings.timeout;
        let ctx = self.context()?;
        let outcome =
            tokio::time::timeout(timeout, ctx.write_multiple_registers(address, values)).await;
        self.settle(address, outcome)?;
        debug!(address, ?values, "wrote registers");
        Ok(())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), StepperError> {
        let timeout = self.settings.timeout;
        let ctx = self.context()?;
        let outcome = tokio::time::timeout(timeout, ctx.write_single_register(address, value)).await;
        self.settle(address, outcome)?;
        debug!(address, value, "wrote register");
        Ok(())
    }
}
