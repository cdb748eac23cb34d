//! In-process pub/sub broker.
//!
//! [`LocalBus`] routes [`Message`]s through a single
//! [`tokio::sync::broadcast`] channel.  Every [`Subscription`] receives every
//! message and keeps only the ones matching its filters, so one slow
//! subscriber never blocks the others.
//!
//! All clones of a `LocalBus` share the same channel and the same connection
//! flag.  Tests hold one clone and hand another to the bridge; whatever one
//! side publishes the other can observe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use stepper_types::StepperError;
use tokio::sync::broadcast;
use tracing::warn;

use crate::client::PubSubClient;
use crate::topic::TopicFilter;

/// Default channel capacity (messages buffered before slow subscribers lag).
const DEFAULT_CAPACITY: usize = 256;

/// One message as carried by the pub/sub layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A subscriber that only delivers messages matching one of its filters.
pub struct Subscription {
    filters: Vec<TopicFilter>,
    receiver: broadcast::Receiver<Message>,
}

impl Subscription {
    /// Build a subscription over `receiver`, validating every filter.
    pub fn new(
        filters: &[String],
        receiver: broadcast::Receiver<Message>,
    ) -> Result<Self, StepperError> {
        let filters = filters
            .iter()
            .map(|f| TopicFilter::new(f))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters, receiver })
    }

    /// Wait for the next matching message.
    ///
    /// Returns `None` once the underlying channel is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) if self.accepts(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "subscription lagged; messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`][Self::recv].  Returns `None` when no
    /// matching message is currently buffered.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.try_recv() {
                Ok(msg) if self.accepts(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    fn accepts(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| f.matches(topic))
    }
}

/// Shared in-process broker.  Clone it cheaply.
#[derive(Clone, Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<Message>,
    connected: Arc<AtomicBool>,
}

impl LocalBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `true` between `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PubSubClient for LocalBus {
    async fn connect(&self) -> Result<(), StepperError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StepperError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    /// Publishing with nobody listening is a normal condition and succeeds.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StepperError> {
        if !self.is_connected() {
            return Err(StepperError::NotConnected("local bus".to_string()));
        }
        let _ = self.sender.send(Message::new(topic, payload));
        Ok(())
    }

    /// Subscriptions on the local bus work whether or not it is connected, so
    /// observers can attach before the bridge starts.
    async fn subscribe(&self, filters: &[String]) -> Result<Subscription, StepperError> {
        Subscription::new(filters, self.sender.subscribe())
    }
}
