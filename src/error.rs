use thiserror::Error;

/// Failure taxonomy of the control core.
///
/// None of these is fatal to the process. Each one maps onto a degraded but
/// well-defined state: the cycle is skipped, the loop holds, a device is
/// pushed toward a standby probe or is disabled for good.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Plausibility check failed for the current sample.
    #[error("telemetry invalid: {0}")]
    TelemetryInvalid(String),

    /// Sustained lack of production.
    #[error("telemetry offline")]
    TelemetryOffline,

    /// Transport error while commanding a device.
    #[error("actuation failed for {device}: {reason}")]
    ActuationFailure { device: String, reason: String },

    /// Sustained extreme grid import or battery discharge.
    #[error("emergency condition: {0}")]
    EmergencyCondition(String),

    /// A controllable device without resolvable actuation address.
    #[error("configuration fault for {device}: {reason}")]
    ConfigurationFault { device: String, reason: String },

    /// Snapshot read/write failure.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ControlError {
    pub fn actuation(device: impl Into<String>, reason: impl ToString) -> Self {
        ControlError::ActuationFailure {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(device: impl Into<String>, reason: impl ToString) -> Self {
        ControlError::ConfigurationFault {
            device: device.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        ControlError::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for ControlError {
    fn from(e: bincode::Error) -> Self {
        ControlError::Persistence(e.to_string())
    }
}

impl From<csv::Error> for ControlError {
    fn from(e: csv::Error) -> Self {
        ControlError::Persistence(e.to_string())
    }
}
