use async_trait::async_trait;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::net::UdpSocket;
use tracing::debug;

use super::Actuator;
use crate::domain::Command;
use crate::error::ControlError;

/// Percentage-controlled load listening for `p:<percent>:0` datagrams.
#[derive(Debug, Clone)]
pub struct UdpPercent {
    name: String,
    target: SocketAddr,
}

impl UdpPercent {
    pub fn resolve(name: &str, address: &str, port: u16) -> Result<Self, ControlError> {
        let target = (address, port)
            .to_socket_addrs()
            .map_err(|e| ControlError::configuration(name, e))?
            .next()
            .ok_or_else(|| ControlError::configuration(name, format!("{address} has no address")))?;
        Ok(Self {
            name: name.to_string(),
            target,
        })
    }

    pub fn payload(percent: i32) -> String {
        format!("p:{}:0", percent.clamp(0, 100))
    }
}

#[async_trait]
impl Actuator for UdpPercent {
    async fn send(&self, command: &Command) -> Result<(), ControlError> {
        let Command::Percent { percent } = *command else {
            return Err(ControlError::actuation(&self.name, format!("unsupported {command:?}")));
        };
        let bind = if self.target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ControlError::actuation(&self.name, e))?;
        let payload = Self::payload(percent);
        socket
            .send_to(payload.as_bytes(), self.target)
            .await
            .map_err(|e| ControlError::actuation(&self.name, e))?;
        debug!(device = %self.name, target = %self.target, %payload, "udp sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_format() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let actuator = UdpPercent::resolve("boiler1", "127.0.0.1", port).unwrap();

        actuator.send(&Command::Percent { percent: 42 }).await.unwrap();

        let mut buf = [0u8; 32];
        let (n, _) = listener.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"p:42:0");
    }

    #[tokio::test]
    async fn test_rejects_switch_command() {
        let actuator = UdpPercent::resolve("boiler1", "127.0.0.1", 1975).unwrap();
        let err = actuator.send(&Command::Switch { on: true }).await.unwrap_err();
        assert!(matches!(err, ControlError::ActuationFailure { .. }));
    }

    #[test]
    fn test_unresolvable_address() {
        let err = UdpPercent::resolve("boiler1", "no such host", 1975).unwrap_err();
        assert!(matches!(err, ControlError::ConfigurationFault { .. }));
    }
}
