//! In-process register link for headless testing.
//!
//! [`SimRegisterLink`] keeps a register file in memory, records every
//! transaction and can be told to fail.  Clones share the same state, so a
//! test keeps one handle for inspection and gives the other to the bridge.
//!
//! With a non-zero latency each transaction yields to the runtime while it is
//! "on the wire".  A second transaction starting in that window is counted as
//! an overlap, which is how tests prove the bridge never interleaves them.
//!
//! # Example
//!
//! ```rust
//! use stepper_hal::{RegisterLink, SimRegisterLink};
//!
//! # tokio_test_block(async {
//! let sim = SimRegisterLink::new();
//! sim.set_register(0x000D, 0x0001);
//!
//! let mut link = sim.clone();
//! link.connect().await.unwrap();
//! assert_eq!(link.read_registers(0x000D, 1).await.unwrap(), vec![0x0001]);
//! assert_eq!(sim.transactions().len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stepper_types::StepperError;

use crate::register_link::RegisterLink;

/// One transaction as observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Read { address: u16, count: u16 },
    WriteMany { address: u16, values: Vec<u16> },
    WriteOne { address: u16, value: u16 },
}

#[derive(Default)]
struct SimState {
    registers: BTreeMap<u16, u16>,
    log: Vec<Transaction>,
    connected: bool,
    connect_attempts: usize,
    fail_connect: bool,
    read_error: Option<StepperError>,
    write_error: Option<StepperError>,
    latency: Duration,
    in_flight: bool,
    overlaps: usize,
}

/// Shared-state simulated device.
#[derive(Clone, Default)]
pub struct SimRegisterLink {
    state: Arc<Mutex<SimState>>,
}

impl SimRegisterLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold every transaction for `latency` before completing it.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state().registers.get(&address).copied().unwrap_or(0)
    }

    /// Refuse every `connect` while `fail` is set.
    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    /// Make every read fail with `error` until cleared with `None`.
    pub fn fail_reads(&self, error: Option<StepperError>) {
        self.state().read_error = error;
    }

    /// Make every write fail with `error` until cleared with `None`.
    pub fn fail_writes(&self, error: Option<StepperError>) {
        self.state().write_error = error;
    }

    /// Drop the line as if the cable were pulled.
    pub fn drop_link(&self) {
        self.state().connected = false;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().log.clone()
    }

    /// Writes only, in order.
    pub fn writes(&self) -> Vec<Transaction> {
        self.state()
            .log
            .iter()
            .filter(|t| !matches!(t, Transaction::Read { .. }))
            .cloned()
            .collect()
    }

    pub fn clear_transactions(&self) {
        self.state().log.clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Number of transactions that started while another was in flight.
    pub fn overlaps(&self) -> usize {
        self.state().overlaps
    }

    async fn transact<T>(
        &self,
        record: Transaction,
        apply: impl FnOnce(&mut SimState) -> Result<T, StepperError>,
    ) -> Result<T, StepperError> {
        let latency = {
            let mut state = self.state();
            if !state.connected {
                return Err(StepperError::NotConnected("sim".to_string()));
            }
            if state.in_flight {
                state.overlaps += 1;
            }
            state.in_flight = true;
            state.log.push(record);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.in_flight = false;
        apply(&mut state)
    }
}

#[async_trait]
impl RegisterLink for SimRegisterLink {
    fn endpoint(&self) -> String {
        "sim".to_string()
    }

    async fn connect(&mut self) -> Result<(), StepperError> {
        let mut state = self.state();
        state.connect_attempts += 1;
        if state.fail_connect {
            return Err(StepperError::Connection {
                endpoint: "sim".to_string(),
                details: "simulated connect failure".to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, StepperError> {
        self.transact(Transaction::Read { address, count }, |state| {
            if let Some(e) = &state.read_error {
                return Err(e.clone());
            }
            Ok((0..count)
                .map(|i| {
                    let addr = address.wrapping_add(i);
                    state.registers.get(&addr).copied().unwrap_or(0)
                })
                .collect())
        })
        .await
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), StepperError> {
        let record = Transaction::WriteMany {
            address,
            values: values.to_vec(),
        };
        self.transact(record, |state| {
            if let Some(e) = &state.write_error {
                return Err(e.clone());
            }
            for (i, &v) in values.iter().enumerate() {
                state.registers.insert(address.wrapping_add(i as u16), v);
            }
            Ok(())
        })
        .await
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), StepperError> {
        self.transact(Transaction::WriteOne { address, value }, |state| {
            if let Some(e) = &state.write_error {
                return Err(e.clone());
            }
            state.registers.insert(address, value);
            Ok(())
        })
        .await
    }
}
