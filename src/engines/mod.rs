// FLOWLINE — COMPUTE ENGINES
// Concrete implementations of the device contract. The host engine runs
// kernels on the CPU against staged buffers; GPU-class engines plug in
// behind the same trait.

pub mod host;

use std::collections::HashMap;
use std::sync::Arc;

use crate::offload::device::SharedDevice;
use crate::{Error, Result};

/// Device registry built at bootstrap: device name → live device. Resolution
/// happens once at init; workers hold the Arc directly afterwards.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, SharedDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry { devices: HashMap::new() }
    }

    pub fn insert(&mut self, dev: SharedDevice) {
        self.devices.insert(dev.name().to_string(), dev);
    }

    pub fn get(&self, name: &str) -> Result<SharedDevice> {
        self.devices
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown compute device {name:?}")))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
