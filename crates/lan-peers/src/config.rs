use crate::model::DeviceClass;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Settings shared by the announcer and the listener of one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Random per-process id; datagrams carrying it are our own echoes.
    #[serde(skip, default = "fresh_instance")]
    pub instance: String,

    /// Name shown to other devices
    pub alias: String,

    pub device: DeviceClass,

    /// TCP port of the transfer server being advertised
    pub service_port: u16,

    /// Well-known UDP port every device listens on
    pub broadcast_port: u16,

    #[serde(with = "millis")]
    pub interval: Duration,

    /// Peers not heard from for this long are dropped from the roster
    #[serde(with = "millis")]
    pub ttl: Duration,

    #[serde(with = "millis")]
    pub sweep_interval: Duration,

    /// Explicit datagram destinations. `None` means every broadcast address
    /// of the local interfaces.
    pub targets: Option<Vec<SocketAddr>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let interval = Duration::from_millis(2000);
        Self {
            instance: fresh_instance(),
            alias: "tsync".to_string(),
            device: DeviceClass::Other,
            service_port: 9939,
            broadcast_port: 9940,
            interval,
            ttl: interval * 2,
            sweep_interval: Duration::from_millis(500),
            targets: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_identity(mut self, alias: impl Into<String>, device: DeviceClass) -> Self {
        self.alias = alias.into();
        self.device = device;
        self
    }
}

fn fresh_instance() -> String {
    uuid::Uuid::new_v4().to_string()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_defaults_to_two_intervals() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.ttl, cfg.interval * 2);
    }

    #[test]
    fn instance_is_not_persisted() {
        let cfg = DiscoveryConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains(&cfg.instance));

        let back: DiscoveryConfig = serde_json::from_str(&json).unwrap();
        assert_ne!(back.instance, cfg.instance);
        assert_eq!(back.interval, cfg.interval);
    }
}
