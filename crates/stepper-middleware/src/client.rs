//! The pub/sub transport seam.
//!
//! The bridge never talks to a broker library directly.  It holds an
//! `Arc<dyn PubSubClient>` and both the in-process [`LocalBus`] and the
//! production [`MqttClient`] plug in behind it.
//!
//! [`LocalBus`]: crate::bus::LocalBus
//! [`MqttClient`]: crate::mqtt::MqttClient

use async_trait::async_trait;
use stepper_types::StepperError;

use crate::bus::Subscription;

/// Topic-based publish / wildcard-subscribe transport.
///
/// # Contract
///
/// * `connect` / `disconnect` are idempotent.
/// * `publish` fails with [`StepperError::NotConnected`] while disconnected.
/// * `subscribe` returns a [`Subscription`] that yields every inbound message
///   whose topic matches at least one of `filters`.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Establish the session with the broker.
    async fn connect(&self) -> Result<(), StepperError>;

    /// Tear down the session.  Safe to call when not connected.
    async fn disconnect(&self) -> Result<(), StepperError>;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StepperError>;

    /// Subscribe to every filter in `filters`.
    async fn subscribe(&self, filters: &[String]) -> Result<Subscription, StepperError>;
}
