//! [`StatusPoller`] – periodic status and position reads.
//!
//! Every tick runs under the serialization lock:
//!
//! 1. A link marked down is reopened and probed.  Polling resumes on the
//!    following tick.
//! 2. Otherwise the status word and the position registers are read, decoded
//!    and stored.  A failed read marks the device disconnected and leaves the
//!    stored axis state untouched.
//!
//! Publishing happens after the lock is released: per-axis `status` and
//! `position` after a good read, and the device status on every tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use stepper_hal::codec::combine_words;
use stepper_types::{AxisState, DeviceStatus, StepperError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::shared::{Hardware, Shared};

/// Periodically reads the device status and positions through the shared
/// lock and publishes the results.  Also the component that reopens a link
/// marked down.
pub struct StatusPoller {
    shared: Arc<Shared>,
    interval: Duration,
}

/// What one tick produced, captured under the lock and published after it.
struct TickReport {
    axes: Option<Vec<AxisState>>,
    status: DeviceStatus,
}

impl StatusPoller {
    pub(crate) fn new(shared: Arc<Shared>, interval: Duration) -> Self {
        Self { shared, interval }
    }

    /// Run the poll loop on a background task until `stop` flips to `true`
    /// or its sender is dropped.
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "status poller started");
            loop {
                tokio::select! {
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => self.tick().await,
                }
            }
            info!("status poller stopped");
        })
    }

    /// Run a single poll cycle.
    pub async fn tick(&self) {
        let report = {
            let mut hw = self.shared.hardware.lock().await;
            let axes = if !hw.status.connected || hw.link_down {
                reconnect(&mut hw).await;
                None
            } else {
                match read_axes(&mut hw, &self.shared).await {
                    Ok(axes) => {
                        hw.axes.clone_from(&axes);
                        hw.status.connected = true;
                        hw.status.last_error = axes
                            .iter()
                            .position(|a| a.has_error)
                            .map(|i| format!("axis {i} reports error"));
                        Some(axes)
                    }
                    Err(e) => {
                        error!(error = %e, "status poll failed; marking device disconnected");
                        hw.status.connected = false;
                        hw.status.last_error = Some(e.to_string());
                        None
                    }
                }
            };
            hw.status.updated_at = Utc::now();
            TickReport {
                axes,
                status: hw.status.clone(),
            }
        };
        self.publish(report).await;
    }

    async fn publish(&self, report: TickReport) {
        let topics = &self.shared.topics;
        if let Some(axes) = &report.axes {
            for (i, axis) in axes.iter().enumerate() {
                let Ok(id) = u8::try_from(i) else { break };
                self.shared
                    .publish_json(&topics.axis(id, "status"), axis)
                    .await;
                self.shared
                    .publish_json(&topics.axis(id, "position"), &json!({ "position": axis.position }))
                    .await;
            }
        }
        self.shared
            .publish_json(&topics.device_status(), &report.status)
            .await;
    }
}

async fn reconnect(hw: &mut Hardware) {
    hw.link.disconnect().await;
    let outcome = match hw.link.connect().await {
        Ok(()) => hw.link.probe().await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            info!(endpoint = %hw.link.endpoint(), "register link re-established");
            hw.status.connected = true;
            hw.status.last_error = None;
            hw.link_down = false;
        }
        Err(e) => {
            warn!(endpoint = %hw.link.endpoint(), error = %e, "reconnect failed; retrying next tick");
            hw.status.connected = false;
            hw.status.last_error = Some(e.to_string());
        }
    }
}

async fn read_axes(hw: &mut Hardware, shared: &Shared) -> Result<Vec<AxisState>, StepperError> {
    let profile = &shared.profile;
    let status = hw.link.read_registers(profile.status_address, 1).await?;
    let word = status
        .first()
        .copied()
        .ok_or_else(|| StepperError::Transport("empty status read".to_string()))?;
    let mut axes = profile.decode_status(word);

    let positions = match profile.position_block() {
        Some((start, count)) => hw.link.read_registers(start, count).await?,
        None => {
            let mut words = Vec::with_capacity(profile.position_addresses.len() * 2);
            for &address in &profile.position_addresses {
                words.extend(hw.link.read_registers(address, 2).await?);
            }
            words
        }
    };
    for (axis, pair) in axes.iter_mut().zip(positions.chunks_exact(2)) {
        axis.position = combine_words(pair[0], pair[1]);
    }
    debug!(status = word, ?positions, "polled device");
    Ok(axes)
}
