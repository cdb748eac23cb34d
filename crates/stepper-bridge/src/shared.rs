//! State shared by the bridge's tasks.
//!
//! The register link and the status store sit behind one
//! [`tokio::sync::Mutex`].  Holding the guard is the only way to reach the
//! link, so at most one register transaction is in flight at any time.

use std::sync::Arc;

use serde::Serialize;
use stepper_hal::{HardwareProfile, RegisterLink};
use stepper_middleware::PubSubClient;
use stepper_types::{AxisState, DeviceStatus};
use tokio::sync::Mutex;
use tracing::warn;

/// Everything guarded by the serialization lock.
pub(crate) struct Hardware {
    pub link: Box<dyn RegisterLink>,
    pub axes: Vec<AxisState>,
    pub status: DeviceStatus,
    /// Set when a command hit a transport failure; the poller reconnects on
    /// its next tick.
    pub link_down: bool,
}

/// Published topic names for one device.
#[derive(Debug, Clone)]
pub(crate) struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(root: &str, device_id: u8) -> Self {
        Self {
            prefix: format!("{root}/stepper{device_id}"),
        }
    }

    /// `{root}/stepper{id}/axis/{axis}/{leaf}`
    pub fn axis(&self, axis: u8, leaf: &str) -> String {
        format!("{}/axis/{axis}/{leaf}", self.prefix)
    }

    /// `{root}/stepper{id}/status`
    pub fn device_status(&self) -> String {
        format!("{}/status", self.prefix)
    }
}

pub(crate) struct Shared {
    pub hardware: Mutex<Hardware>,
    pub pubsub: Arc<dyn PubSubClient>,
    pub profile: HardwareProfile,
    pub topics: Topics,
}

impl Shared {
    /// Serialize `value` and publish it.  Failures are logged and swallowed.
    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                warn!(topic = %topic, error = %e, "failed to serialize payload");
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(topic, payload).await {
            warn!(topic = %topic, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
pub(crate) fn test_shared(
    link: stepper_hal::SimRegisterLink,
    bus: stepper_middleware::LocalBus,
) -> Arc<Shared> {
    test_shared_with(link, bus, HardwareProfile::default())
}

#[cfg(test)]
pub(crate) fn test_shared_with(
    link: stepper_hal::SimRegisterLink,
    bus: stepper_middleware::LocalBus,
    profile: HardwareProfile,
) -> Arc<Shared> {
    Arc::new(Shared {
        hardware: Mutex::new(Hardware {
            link: Box::new(link),
            axes: vec![AxisState::default(); usize::from(profile.axis_count)],
            status: DeviceStatus::new(1),
            link_down: false,
        }),
        pubsub: Arc::new(bus),
        profile,
        topics: Topics::new("stepper", 1),
    })
}
