use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::sim::SimulatedLoads;
use super::{Actuator, HardwareMode, HttpRelay, JsonHttp, UdpPercent};
use crate::config::DeviceConfig;
use crate::domain::{Device, DeviceKind, DeviceState};
use crate::error::ControlError;

/// The device registry together with the transport of every enabled device.
pub struct Fleet {
    pub devices: Vec<Device>,
    pub actuators: HashMap<String, Arc<dyn Actuator>>,
}

impl Fleet {
    pub fn actuator(&self, name: &str) -> Option<Arc<dyn Actuator>> {
        self.actuators.get(name).cloned()
    }
}

/// Factory for creating device instances and their transports
pub struct DeviceFactory {
    mode: HardwareMode,
    loads: SimulatedLoads,
}

impl DeviceFactory {
    pub fn new(mode: HardwareMode) -> Self {
        Self {
            mode,
            loads: SimulatedLoads::default(),
        }
    }

    /// Attaches simulated actuators to an existing house model.
    pub fn with_loads(mut self, loads: SimulatedLoads) -> Self {
        self.loads = loads;
        self
    }

    /// Builds the registry in declaration order. Devices whose transport
    /// cannot be resolved stay in the registry as `Disabled`.
    pub fn build(&self, configs: &[DeviceConfig]) -> Fleet {
        let mut devices = Vec::with_capacity(configs.len());
        let mut actuators = HashMap::new();

        for c in configs {
            let mut device = Device::new(&c.name, c.kind, c.total, c.min);
            if let (Some(from), Some(to)) = (c.from, c.to) {
                device = device.with_window(from, to);
            }
            match self.actuator(c) {
                Ok(a) => {
                    actuators.insert(c.name.clone(), a);
                }
                Err(e) => {
                    warn!(device = %c.name, error = %e, "device disabled");
                    device.transition(DeviceState::Disabled);
                }
            }
            devices.push(device);
        }

        info!(
            mode = ?self.mode,
            devices = devices.len(),
            enabled = actuators.len(),
            "device registry built"
        );
        Fleet { devices, actuators }
    }

    fn actuator(&self, c: &DeviceConfig) -> Result<Arc<dyn Actuator>, ControlError> {
        if self.mode == HardwareMode::Simulated {
            return Ok(Arc::new(self.loads.actuator(&c.name, c.total)));
        }
        let address = c
            .address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ControlError::configuration(&c.name, "no actuation address"))?;
        Ok(match c.kind {
            DeviceKind::Percentage => Arc::new(UdpPercent::resolve(&c.name, address, c.port)?),
            DeviceKind::OnOff => Arc::new(HttpRelay::resolve(&c.name, address, c.relay.unwrap_or(1))?),
            DeviceKind::Battery => Arc::new(JsonHttp::resolve(&c.name, address)?),
        })
    }
}

impl Default for DeviceFactory {
    fn default() -> Self {
        Self::new(HardwareMode::Simulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig::new("akku", DeviceKind::Battery, 4500).address("127.0.0.1:8081"),
            DeviceConfig::new("boiler1", DeviceKind::Percentage, 2000).address("127.0.0.1"),
            DeviceConfig::new("kitchen", DeviceKind::OnOff, 450).min(500),
            DeviceConfig::new("boiler3", DeviceKind::Percentage, 2000).window(10, 15),
        ]
    }

    #[test]
    fn test_simulated_registry_is_fully_enabled() {
        let fleet = DeviceFactory::default().build(&registry());
        assert_eq!(fleet.devices.len(), 4);
        assert_eq!(fleet.actuators.len(), 4);
        assert_eq!(fleet.devices[0].state, DeviceState::Standby);
        assert_eq!(fleet.devices[3].window, Some((10, 15)));
    }

    #[test]
    fn test_missing_address_disables_device() {
        let fleet = DeviceFactory::new(HardwareMode::Live).build(&registry());
        assert_eq!(fleet.devices[2].state, DeviceState::Disabled);
        assert!(fleet.actuator("kitchen").is_none());
        assert_eq!(fleet.devices[1].state, DeviceState::Active);
        assert!(fleet.actuator("boiler1").is_some());
        assert!(fleet.actuator("akku").is_some());
    }
}
