//! MQTT transport backed by `rumqttc`.
//!
//! [`MqttClient`] owns one `rumqttc` session.  A background task drives the
//! event loop, fans inbound `PUBLISH` packets out to every [`Subscription`]
//! and re-issues the active subscriptions after the broker drops and
//! re-establishes the session.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use stepper_types::StepperError;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{Message, Subscription};
use crate::client::PubSubClient;

/// Capacity of the request channel between [`AsyncClient`] and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the inbound fan-out channel.
const INBOUND_CAPACITY: usize = 256;

/// Pause between reconnect attempts once the session has been established.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// QoS level (0, 1 or 2) used for publishing and subscribing.
    pub qos: u8,
    /// How long `connect` waits for the broker's `CONNACK`.
    pub connect_timeout: Duration,
}

impl MqttSettings {
    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

/// Map a numeric QoS level onto the `rumqttc` enum.
pub fn qos_from_level(level: u8) -> Result<QoS, StepperError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(StepperError::PubSub(format!("invalid MQTT QoS level {other}"))),
    }
}

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// Production [`PubSubClient`] speaking MQTT 3.1.1.
pub struct MqttClient {
    settings: MqttSettings,
    qos: QoS,
    session: Mutex<Option<Session>>,
    inbound: broadcast::Sender<Message>,
    active_filters: Arc<StdMutex<Vec<String>>>,
}

impl MqttClient {
    /// Create a client for `settings`.  No network traffic happens until
    /// [`connect`][PubSubClient::connect].
    ///
    /// # Errors
    ///
    /// Returns [`StepperError::PubSub`] for an invalid QoS level.
    pub fn new(settings: MqttSettings) -> Result<Self, StepperError> {
        let qos = qos_from_level(settings.qos)?;
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Ok(Self {
            settings,
            qos,
            session: Mutex::new(None),
            inbound,
            active_filters: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    async fn client(&self) -> Result<AsyncClient, StepperError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or_else(|| StepperError::NotConnected(self.settings.endpoint()))
    }
}

#[async_trait]
impl PubSubClient for MqttClient {
    async fn connect(&self) -> Result<(), StepperError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            self.inbound.clone(),
            Arc::clone(&self.active_filters),
            self.qos,
            ready_tx,
        ));

        let endpoint = self.settings.endpoint();
        let outcome = match tokio::time::timeout(self.settings.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(details))) => Err(details),
            Ok(Err(_)) => Err("event loop exited before CONNACK".to_string()),
            Err(_) => Err(format!(
                "no CONNACK within {:?}",
                self.settings.connect_timeout
            )),
        };

        match outcome {
            Ok(()) => {
                info!(endpoint = %endpoint, client_id = %self.settings.client_id, "MQTT session established");
                *session = Some(Session {
                    client,
                    event_loop: handle,
                });
                Ok(())
            }
            Err(details) => {
                handle.abort();
                Err(StepperError::Connection { endpoint, details })
            }
        }
    }

    async fn disconnect(&self) -> Result<(), StepperError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = session.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request not delivered");
        }
        session.event_loop.abort();
        if let Ok(mut filters) = self.active_filters.lock() {
            filters.clear();
        }
        info!(endpoint = %self.settings.endpoint(), "MQTT session closed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), StepperError> {
        let client = self.client().await?;
        client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| StepperError::PubSub(format!("publish to {topic} failed: {e}")))
    }

    async fn subscribe(&self, filters: &[String]) -> Result<Subscription, StepperError> {
        // Validate before anything reaches the broker.
        let subscription = Subscription::new(filters, self.inbound.subscribe())?;
        let client = self.client().await?;
        for filter in filters {
            client
                .subscribe(filter.as_str(), self.qos)
                .await
                .map_err(|e| StepperError::PubSub(format!("subscribe to {filter} failed: {e}")))?;
            debug!(filter = %filter, "subscribed");
        }
        if let Ok(mut active) = self.active_filters.lock() {
            active.extend(filters.iter().cloned());
        }
        Ok(subscription)
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    inbound: broadcast::Sender<Message>,
    active_filters: Arc<StdMutex<Vec<String>>>,
    qos: QoS,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let details = format!("broker refused connection: {:?}", ack.code);
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(details));
                            return;
                        }
                        None => warn!(%details, "MQTT reconnect refused"),
                    }
                    continue;
                }
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    None => {
                        info!("MQTT session re-established; restoring subscriptions");
                        let filters = active_filters
                            .lock()
                            .map(|f| f.clone())
                            .unwrap_or_default();
                        for filter in filters {
                            if let Err(e) = client.try_subscribe(filter.as_str(), qos) {
                                warn!(filter = %filter, error = %e, "resubscribe failed");
                            }
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = inbound.send(Message::new(publish.topic, publish.payload.to_vec()));
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
                warn!(error = %e, "MQTT connection error; retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
