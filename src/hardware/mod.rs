//! Device transports and telemetry providers.

pub mod factory;
pub mod json;
pub mod relay;
pub mod sim;
pub mod udp;

pub use factory::{DeviceFactory, Fleet};
pub use json::JsonHttp;
pub use relay::HttpRelay;
pub use sim::{SimulatedActuator, SimulatedHome, SimulatedLoads};
pub use udp::UdpPercent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Command, Reading};
use crate::error::ControlError;

/// Hardware mode configuration
///
/// `Simulated` never touches the network. Commands go to an in-process
/// house model that also produces the telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    #[default]
    Simulated,
    Live,
}

/// Command transport of one device. Sends are fire-and-forget, the
/// dispatcher judges the effect from telemetry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn send(&self, command: &Command) -> Result<(), ControlError>;
}

/// Polled producer of raw readings.
#[async_trait]
pub trait TelemetrySource: Send {
    async fn poll(&mut self) -> Result<Reading, ControlError>;
}
