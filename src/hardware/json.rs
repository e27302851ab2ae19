use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

use super::Actuator;
use crate::domain::Command;
use crate::error::ControlError;

/// Battery inverter gateway accepting the command as JSON on `POST /command`.
#[derive(Debug, Clone)]
pub struct JsonHttp {
    name: String,
    url: Url,
    client: Client,
}

impl JsonHttp {
    pub fn resolve(name: &str, address: &str) -> Result<Self, ControlError> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let url = Url::parse(&raw)
            .and_then(|u| u.join("command"))
            .map_err(|e| ControlError::configuration(name, e))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ControlError::configuration(name, e))?;
        Ok(Self {
            name: name.to_string(),
            url,
            client,
        })
    }
}

#[async_trait]
impl Actuator for JsonHttp {
    async fn send(&self, command: &Command) -> Result<(), ControlError> {
        self.client
            .post(self.url.clone())
            .json(command)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ControlError::actuation(&self.name, e))?;
        debug!(device = %self.name, ?command, "command posted");
        Ok(())
    }
}
