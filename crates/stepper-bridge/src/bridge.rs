//! [`Bridge`] – lifecycle and composition.
//!
//! A running bridge owns two background tasks:
//!
//! * the [`StatusPoller`];
//! * the dispatcher, which drains the command subscription, routes each
//!   message and runs the commands strictly in arrival order.
//!
//! Both tasks and every command share the single serialization lock in
//! [`Shared`], so the poller and commands interleave only at transaction
//! boundaries.

use std::sync::Arc;
use std::time::Duration;

use stepper_hal::{HardwareProfile, ProfileError, RegisterLink};
use stepper_middleware::{Message, PubSubClient, Subscription};
use stepper_types::{AxisState, Command, DeviceStatus, StepperError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::axis::AxisController;
use crate::poller::StatusPoller;
use crate::router::{CommandRouter, Routed};
use crate::shared::{Hardware, Shared, Topics};

/// Static configuration of one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Modbus slave id and the `{deviceId}` topic segment.
    pub device_id: u8,
    pub topic_root: String,
    pub poll_interval: Duration,
    /// Upper bound for joining each background task in [`Bridge::stop`].
    pub join_timeout: Duration,
    pub profile: HardwareProfile,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            topic_root: "stepper".to_string(),
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            profile: HardwareProfile::default(),
        }
    }
}

struct Running {
    stop_tx: watch::Sender<bool>,
    poller: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// One device exposed on the pub/sub side.
///
/// Built with [`Bridge::new`], started with [`Bridge::start`] and torn down
/// with [`Bridge::stop`].  All methods take `&self`, so a bridge can be
/// shared behind an [`Arc`].
pub struct Bridge {
    config: BridgeConfig,
    shared: Arc<Shared>,
    router: Arc<CommandRouter>,
    controllers: Arc<[AxisController]>,
    running: Mutex<Option<Running>>,
}

impl Bridge {
    /// Assemble a bridge.  Nothing is connected until [`start`][Self::start].
    ///
    /// # Errors
    ///
    /// Returns a [`ProfileError`] when the hardware profile is inconsistent.
    pub fn new(
        config: BridgeConfig,
        link: Box<dyn RegisterLink>,
        pubsub: Arc<dyn PubSubClient>,
    ) -> Result<Self, ProfileError> {
        config.profile.validate()?;
        let axis_count = config.profile.axis_count;
        let shared = Arc::new(Shared {
            hardware: Mutex::new(Hardware {
                link,
                axes: vec![AxisState::default(); usize::from(axis_count)],
                status: DeviceStatus::new(config.device_id),
                link_down: false,
            }),
            pubsub,
            profile: config.profile.clone(),
            topics: Topics::new(&config.topic_root, config.device_id),
        });
        let controllers = (0..axis_count)
            .map(|axis| AxisController::new(axis, Arc::clone(&shared)))
            .collect();
        let router = Arc::new(CommandRouter::new(
            config.topic_root.clone(),
            config.device_id,
            axis_count,
        ));
        Ok(Self {
            config,
            shared,
            router,
            controllers,
            running: Mutex::new(None),
        })
    }

    /// Connect both transports, subscribe and spawn the background tasks.
    /// A no-op on a bridge that is already running.
    ///
    /// # Errors
    ///
    /// * [`StepperError::Connection`] when the register link cannot be
    ///   opened.  The pub/sub session is closed again and nothing has been
    ///   subscribed.
    /// * Whatever the pub/sub client reports for `connect` or `subscribe`.
    pub async fn start(&self) -> Result<(), StepperError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("bridge already running");
            return Ok(());
        }

        let pubsub = &self.shared.pubsub;
        pubsub.connect().await?;

        {
            let mut hw = self.shared.hardware.lock().await;
            if let Err(e) = hw.link.connect().await {
                let endpoint = hw.link.endpoint();
                drop(hw);
                error!(endpoint = %endpoint, error = %e, "register link connection failed");
                if let Err(e) = pubsub.disconnect().await {
                    warn!(error = %e, "pub/sub disconnect failed");
                }
                return Err(match e {
                    e @ StepperError::Connection { .. } => e,
                    other => StepperError::Connection {
                        endpoint,
                        details: other.to_string(),
                    },
                });
            }
            hw.status.connected = true;
            hw.status.last_error = None;
            hw.link_down = false;
        }

        let subscription = match pubsub.subscribe(&self.router.subscriptions()).await {
            Ok(s) => s,
            Err(e) => {
                self.shared.hardware.lock().await.link.disconnect().await;
                if let Err(e) = pubsub.disconnect().await {
                    warn!(error = %e, "pub/sub disconnect failed");
                }
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = StatusPoller::new(Arc::clone(&self.shared), self.config.poll_interval)
            .spawn(stop_rx.clone());
        let dispatcher = tokio::spawn(run_dispatcher(
            subscription,
            Arc::clone(&self.router),
            Arc::clone(&self.controllers),
            stop_rx,
        ));
        *running = Some(Running {
            stop_tx,
            poller,
            dispatcher,
        });
        info!(
            device_id = self.config.device_id,
            root = %self.config.topic_root,
            axes = self.controllers.len(),
            "bridge started"
        );
        Ok(())
    }

    /// Stop the background tasks and close both transports.  Idempotent.
    pub async fn stop(&self) {
        let Some(run) = self.running.lock().await.take() else {
            return;
        };
        let _ = run.stop_tx.send(true);
        join_bounded("status poller", run.poller, self.config.join_timeout).await;
        join_bounded("dispatcher", run.dispatcher, self.config.join_timeout).await;

        {
            let mut hw = self.shared.hardware.lock().await;
            hw.link.disconnect().await;
            hw.status.connected = false;
        }
        if let Err(e) = self.shared.pubsub.disconnect().await {
            warn!(error = %e, "pub/sub disconnect failed");
        }
        info!(device_id = self.config.device_id, "bridge stopped");
    }

    /// `true` between a successful [`start`][Self::start] and [`stop`][Self::stop].
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Most recently polled state of `axis`, or `None` for an unknown axis.
    pub async fn axis_state(&self, axis: u8) -> Option<AxisState> {
        self.shared
            .hardware
            .lock()
            .await
            .axes
            .get(usize::from(axis))
            .copied()
    }

    /// Snapshot of the connection state and the last reported error.
    pub async fn device_status(&self) -> DeviceStatus {
        self.shared.hardware.lock().await.status.clone()
    }

    /// Execute `command` directly.
    pub async fn dispatch(&self, command: &Command) -> Result<(), StepperError> {
        if command.device_id != self.config.device_id {
            return Err(StepperError::InvalidCommand(format!(
                "command for device {} sent to device {}",
                command.device_id, self.config.device_id
            )));
        }
        dispatch(&self.controllers, command).await
    }

    /// Run one poll cycle outside the background schedule.
    pub async fn poll_once(&self) {
        StatusPoller::new(Arc::clone(&self.shared), self.config.poll_interval)
            .tick()
            .await;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Background tasks
// ────────────────────────────────────────────────────────────────────────────

/// Route `command` to its axis, or to every axis in order for a device-level
/// command.  Every addressed axis runs even when an earlier one fails; the
/// first error is returned.
async fn dispatch(controllers: &[AxisController], command: &Command) -> Result<(), StepperError> {
    match command.axis_id {
        Some(axis) => {
            let controller = controllers.get(usize::from(axis)).ok_or_else(|| {
                StepperError::InvalidCommand(format!(
                    "axis {axis} out of range; device has {} axes",
                    controllers.len()
                ))
            })?;
            controller.execute(&command.action).await
        }
        None => {
            let mut first_error = None;
            for controller in controllers {
                if let Err(e) = controller.execute(&command.action).await {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        }
    }
}

/// Drain the command subscription one message at a time.  Commands reach the
/// lock in the order they arrived; a command already on the wire finishes
/// before the stop signal is looked at again.
async fn run_dispatcher(
    mut subscription: Subscription,
    router: Arc<CommandRouter>,
    controllers: Arc<[AxisController]>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            message = subscription.recv() => {
                let Some(message) = message else {
                    warn!("command subscription closed");
                    break;
                };
                if let Some(command) = route(&router, &message) {
                    // Failures are acknowledged and logged by the controller.
                    let _ = dispatch(&controllers, &command).await;
                }
            }
        }
    }
}

fn route(router: &CommandRouter, message: &Message) -> Option<Command> {
    match router.route(&message.topic, &message.payload) {
        Ok(Routed::Command(command)) => {
            debug!(topic = %message.topic, action = command.action.ack_name(), "command received");
            Some(command)
        }
        Ok(Routed::Ignored { device }) => {
            debug!(topic = %message.topic, device = %device, "command for another device ignored");
            None
        }
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "dropping unparseable command");
            None
        }
    }
}

async fn join_bounded(name: &str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(task = name, "task joined"),
        Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
        Err(_) => {
            warn!(task = name, ?timeout, "task did not stop in time; aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepper_hal::SimRegisterLink;
    use stepper_hal::sim::Transaction;
    use stepper_middleware::LocalBus;
    use stepper_types::{AbsoluteMove, Ack, Action};
    use tokio::task::JoinSet;

    const ACKS: &str = "stepper/stepper1/axis/+/ack";

    fn config() -> BridgeConfig {
        BridgeConfig {
            poll_interval: Duration::from_secs(3600),
            join_timeout: Duration::from_millis(500),
            ..BridgeConfig::default()
        }
    }

    fn bridge(sim: &SimRegisterLink, bus: &LocalBus, config: BridgeConfig) -> Bridge {
        Bridge::new(config, Box::new(sim.clone()), Arc::new(bus.clone())).unwrap()
    }

    async fn acks(bus: &LocalBus) -> Subscription {
        bus.subscribe(&[ACKS.to_string()]).await.unwrap()
    }

    async fn next_ack(sub: &mut Subscription) -> (String, Ack) {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("ack within 2s")
            .expect("bus open");
        (msg.topic, serde_json::from_slice(&msg.payload).unwrap())
    }

    #[tokio::test]
    async fn absolute_move_end_to_end() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let mut acks = acks(&bus).await;
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();
        assert!(b.is_running().await);
        assert!(bus.is_connected());

        bus.publish(
            "stepper/1/axis/0/move/absolute",
            br#"{"position":1000,"speed":500}"#.to_vec(),
        )
        .await
        .unwrap();

        let (topic, ack) = next_ack(&mut acks).await;
        assert_eq!(topic, "stepper/stepper1/axis/0/ack");
        assert_eq!(ack.command, "move_absolute");
        assert!(ack.success);
        assert_eq!(ack.params.unwrap()["acceleration"], 1000);
        assert_eq!(
            sim.writes(),
            vec![Transaction::WriteMany {
                address: 0x0000,
                values: vec![0x0102, 0, 1000, 0, 0, 0, 500, 1000, 1000],
            }]
        );
        b.stop().await;
    }

    #[tokio::test]
    async fn link_failure_aborts_start() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        sim.fail_connect(true);
        let b = bridge(&sim, &bus, config());

        let result = b.start().await;
        assert!(matches!(result, Err(StepperError::Connection { .. })));
        assert!(!b.is_running().await);
        assert!(!bus.is_connected());
    }

    #[tokio::test]
    async fn second_start_is_a_noop() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(sim.connect_attempts(), 1);
        b.stop().await;
    }

    #[tokio::test]
    async fn stop_is_bounded_idempotent_and_closes_the_link() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let b = bridge(
            &sim,
            &bus,
            BridgeConfig {
                poll_interval: Duration::from_millis(5),
                ..config()
            },
        );
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(2), b.stop())
            .await
            .expect("stop must finish within the join timeout");
        assert!(!b.is_running().await);
        assert!(!sim.is_connected());
        assert!(!bus.is_connected());
        assert!(!b.device_status().await.connected);

        let seen = sim.transactions().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sim.transactions().len(), seen, "no polling after stop");

        b.stop().await;
    }

    #[tokio::test]
    async fn stop_aborts_a_task_stuck_on_the_link() {
        let sim = SimRegisterLink::new().with_latency(Duration::from_secs(10));
        let bus = LocalBus::default();
        let b = bridge(
            &sim,
            &bus,
            BridgeConfig {
                poll_interval: Duration::from_millis(5),
                join_timeout: Duration::from_millis(100),
                ..config()
            },
        );
        b.start().await.unwrap();
        // First tick is immediate and parks on the status read.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(2), b.stop())
            .await
            .expect("stop must not wait for the stuck transaction");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!b.is_running().await);
        assert!(!sim.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn commands_are_written_in_arrival_order() {
        for _ in 0..20 {
            let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
            let mut acks = acks(&bus).await;
            let b = bridge(&sim, &bus, config());
            b.start().await.unwrap();

            bus.publish(
                "stepper/1/axis/0/move/absolute",
                br#"{"position":1000}"#.to_vec(),
            )
            .await
            .unwrap();
            bus.publish("stepper/1/axis/0/stop", Vec::new()).await.unwrap();

            let (_, first) = next_ack(&mut acks).await;
            let (_, second) = next_ack(&mut acks).await;
            assert_eq!(first.command, "move_absolute");
            assert_eq!(second.command, "stop");
            let writes = sim.writes();
            assert_eq!(writes.len(), 2);
            assert!(matches!(writes[0], Transaction::WriteMany { .. }));
            assert_eq!(
                writes[1],
                Transaction::WriteOne {
                    address: 0x0000,
                    value: 0
                }
            );
            b.stop().await;
        }
    }

    #[tokio::test]
    async fn foreign_device_is_never_dispatched() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let mut acks = acks(&bus).await;
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();

        bus.publish("stepper/2/axis/0/stop", Vec::new()).await.unwrap();
        bus.publish("stepper/stepper2/enable", Vec::new()).await.unwrap();
        bus.publish("stepper/1/axis/0/reset", Vec::new()).await.unwrap();

        let (_, ack) = next_ack(&mut acks).await;
        assert_eq!(ack.command, "reset");
        assert!(acks.try_recv().is_none());
        assert_eq!(
            sim.writes(),
            vec![Transaction::WriteOne {
                address: 0x0005,
                value: 1
            }]
        );
        b.stop().await;
    }

    #[tokio::test]
    async fn non_numeric_servo_speed_writes_nothing() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let mut acks = acks(&bus).await;
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();

        bus.publish("stepper/1/axis/1/servo_speed", br#"{"speed":"abc"}"#.to_vec())
            .await
            .unwrap();
        bus.publish("stepper/1/axis/1/servo_speed", br#"{"speed":"12.7"}"#.to_vec())
            .await
            .unwrap();

        let (topic, ack) = next_ack(&mut acks).await;
        assert_eq!(topic, "stepper/stepper1/axis/1/ack");
        assert_eq!(ack.command, "set_servo_speed");
        assert_eq!(ack.params.unwrap()["speed"], 12);
        assert!(acks.try_recv().is_none());
        assert_eq!(
            sim.writes(),
            vec![Transaction::WriteMany {
                address: 0x0000,
                values: vec![0x0203, 1, 12],
            }]
        );
        b.stop().await;
    }

    #[tokio::test]
    async fn device_level_command_fans_out_per_axis() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let mut acks = acks(&bus).await;
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();

        bus.publish("stepper/1/enable", Vec::new()).await.unwrap();

        let (first, a0) = next_ack(&mut acks).await;
        let (second, a1) = next_ack(&mut acks).await;
        assert_eq!(first, "stepper/stepper1/axis/0/ack");
        assert_eq!(second, "stepper/stepper1/axis/1/ack");
        assert!(a0.success && a1.success);
        assert_eq!(a0.command, "enable");
        assert_eq!(sim.writes().len(), 2);
        b.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commands_never_interleave() {
        let sim = SimRegisterLink::new().with_latency(Duration::from_millis(1));
        let bus = LocalBus::new(1024);
        let b = Arc::new(bridge(
            &sim,
            &bus,
            BridgeConfig {
                poll_interval: Duration::from_millis(2),
                ..config()
            },
        ));
        b.start().await.unwrap();

        let mut tasks = JoinSet::new();
        for i in 0..32u8 {
            let b = Arc::clone(&b);
            tasks.spawn(async move {
                let command = Command {
                    device_id: 1,
                    axis_id: if i % 5 == 0 { None } else { Some(i % 2) },
                    action: Action::MoveAbsolute(AbsoluteMove {
                        position: i32::from(i) * 100,
                        speed: 500,
                        acceleration: 1000,
                        deceleration: 1000,
                    }),
                };
                b.dispatch(&command).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        b.stop().await;

        assert_eq!(sim.overlaps(), 0);
        assert!(sim.writes().len() >= 32);
    }

    #[tokio::test]
    async fn accessors_reflect_last_poll() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let b = bridge(&sim, &bus, config());
        assert_eq!(b.axis_state(0).await, Some(AxisState::default()));
        assert!(!b.device_status().await.connected);

        b.start().await.unwrap();
        sim.set_register(0x000D, 0x0001 | 0x4000);
        sim.set_register(0x0013, 7);
        b.poll_once().await;

        let axis0 = b.axis_state(0).await.unwrap();
        let axis1 = b.axis_state(1).await.unwrap();
        assert!(axis0.limit_neg);
        assert!(axis1.is_servo_mode);
        assert_eq!(axis1.position, 7);
        assert_eq!(b.axis_state(2).await, None);
        assert!(b.device_status().await.connected);
        b.stop().await;
    }

    #[tokio::test]
    async fn direct_dispatch_validates_the_address() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();

        let foreign = Command {
            device_id: 9,
            axis_id: Some(0),
            action: Action::Stop,
        };
        assert!(matches!(
            b.dispatch(&foreign).await,
            Err(StepperError::InvalidCommand(_))
        ));
        let out_of_range = Command {
            device_id: 1,
            axis_id: Some(4),
            action: Action::Stop,
        };
        assert!(matches!(
            b.dispatch(&out_of_range).await,
            Err(StepperError::InvalidCommand(_))
        ));
        assert!(sim.writes().is_empty());
        b.stop().await;
    }

    #[tokio::test]
    async fn command_transport_failure_reconnects_on_next_poll() {
        let (sim, bus) = (SimRegisterLink::new(), LocalBus::default());
        let mut acks = acks(&bus).await;
        let b = bridge(&sim, &bus, config());
        b.start().await.unwrap();

        sim.fail_writes(Some(StepperError::Transport("no response".into())));
        let stop = Command {
            device_id: 1,
            axis_id: Some(0),
            action: Action::Stop,
        };
        assert!(b.dispatch(&stop).await.is_err());
        let (_, ack) = next_ack(&mut acks).await;
        assert_eq!(ack.command, "stop");
        assert!(!ack.success);

        sim.fail_writes(None);
        b.poll_once().await;
        assert_eq!(sim.connect_attempts(), 2);
        assert!(b.device_status().await.connected);
        b.stop().await;
    }

    #[test]
    fn inconsistent_profile_is_rejected() {
        let mut config = config();
        config.profile.axis_count = 3;
        let result = Bridge::new(
            config,
            Box::new(SimRegisterLink::new()),
            Arc::new(LocalBus::default()),
        );
        assert!(result.is_err());
    }
}
