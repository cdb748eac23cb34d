//! `stepper-middleware` – pub/sub plumbing for the stepper bridge.
//!
//! Moves `(topic, payload)` pairs between the bridge and an automation
//! supervisor without caring about what the payloads mean.
//!
//! # Modules
//!
//! - [`client`] – the [`PubSubClient`] trait every transport implements.
//! - [`topic`] – MQTT topic-filter parsing and wildcard matching.
//! - [`bus`] – [`LocalBus`], an in-process broker built on Tokio broadcast
//!   channels, used for headless runs and tests.
//! - [`mqtt`] – [`MqttClient`], the production transport backed by `rumqttc`.

pub mod bus;
pub mod client;
pub mod mqtt;
pub mod topic;

pub use bus::{LocalBus, Message, Subscription};
pub use client::PubSubClient;
pub use mqtt::{MqttClient, MqttSettings};
pub use topic::TopicFilter;
