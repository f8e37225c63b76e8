//! Device conditions that gate constrained stages.

use crate::model::DeviceState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Publishes the device conditions that stage constraints wait on.
#[derive(Clone)]
pub struct DeviceMonitor {
    tx: Arc<watch::Sender<DeviceState>>,
}

impl DeviceMonitor {
    pub fn new(initial: DeviceState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> DeviceState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.tx.subscribe()
    }

    pub fn set(&self, state: DeviceState) {
        info!(charging = state.charging, storage_low = state.storage_low, "device state");
        self.tx.send_replace(state);
    }

    pub fn set_charging(&self, charging: bool) {
        self.set(DeviceState {
            charging,
            ..self.current()
        });
    }

    pub fn set_storage_low(&self, storage_low: bool) {
        self.set(DeviceState {
            storage_low,
            ..self.current()
        });
    }
}

impl Default for DeviceMonitor {
    fn default() -> Self {
        Self::new(DeviceState::default())
    }
}
