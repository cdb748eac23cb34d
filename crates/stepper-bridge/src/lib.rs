//! `stepper-bridge` – MQTT front end for a multi-axis stepper controller.
//!
//! # Modules
//!
//! - [`router`] – [`CommandRouter`]: parses inbound topics and payloads into
//!   typed [`Command`][stepper_types::Command]s.
//! - [`axis`] – [`AxisController`]: turns a command into one register
//!   transaction and acknowledges it.
//! - [`poller`] – [`StatusPoller`]: periodic status/position reads and state
//!   publication, with reconnect on link loss.
//! - [`bridge`] – [`Bridge`]: lifecycle, the serialization lock and the
//!   command dispatcher.
//! - [`telemetry`] – [`init_tracing`]: `tracing` subscriber with optional
//!   OTLP export.

pub mod axis;
pub mod bridge;
pub mod poller;
pub mod router;
mod shared;
pub mod telemetry;

pub use axis::{AxisController, Frame};
pub use bridge::{Bridge, BridgeConfig};
pub use poller::StatusPoller;
pub use router::{CommandRouter, ParseError, Routed};
pub use telemetry::{TracerProviderGuard, init_tracing};
