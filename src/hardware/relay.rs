use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

use super::Actuator;
use crate::domain::Command;
use crate::error::ControlError;

const TIMEOUT: Duration = Duration::from_secs(3);

/// Relay switched with `GET /cm?cmnd=Power<r> On|Off`.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    name: String,
    base: Url,
    relay: u8,
    client: Client,
}

impl HttpRelay {
    pub fn resolve(name: &str, address: &str, relay: u8) -> Result<Self, ControlError> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let base = Url::parse(&raw).map_err(|e| ControlError::configuration(name, e))?;
        if base.host_str().is_none() {
            return Err(ControlError::configuration(name, "missing host"));
        }
        let client = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| ControlError::configuration(name, e))?;
        Ok(Self {
            name: name.to_string(),
            base,
            relay,
            client,
        })
    }

    fn command(&self, on: bool) -> String {
        format!("Power{} {}", self.relay, if on { "On" } else { "Off" })
    }
}

#[async_trait]
impl Actuator for HttpRelay {
    async fn send(&self, command: &Command) -> Result<(), ControlError> {
        let Command::Switch { on } = *command else {
            return Err(ControlError::actuation(&self.name, format!("unsupported {command:?}")));
        };
        let url = self
            .base
            .join("cm")
            .map_err(|e| ControlError::actuation(&self.name, e))?;
        let cmnd = self.command(on);
        self.client
            .get(url)
            .query(&[("cmnd", cmnd.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ControlError::actuation(&self.name, e))?;
        debug!(device = %self.name, %cmnd, "relay switched");
        Ok(())
    }
}
