use std::path::PathBuf;
use std::time::Duration;

use lan_peers::DeviceClass;
use serde::{Deserialize, Serialize};

use crate::protocol::PACKAGE_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory for the identity key, staged archives and projects
    pub data_dir: PathBuf,

    /// Name announced to peers in the hello message
    pub alias: String,

    pub device: DeviceClass,

    /// Port the transfer server listens on
    pub listen_port: u16,

    /// Plaintext bytes per archive frame (256 KiB)
    pub chunk_size: usize,

    /// Offers with a newer package version are declined automatically
    pub max_package_version: u32,

    /// Bounds TCP connect and the handshake
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".tsync"),
            alias: "tsync".to_string(),
            device: DeviceClass::Other,
            listen_port: 9939,
            chunk_size: 256 * 1024,
            max_package_version: PACKAGE_VERSION,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransferConfig {
    pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = data_dir;
        self
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    /// Root of the archive store (`incoming/`, `archives/`)
    pub fn transfers_dir(&self) -> PathBuf {
        self.data_dir.join("transfers")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.data_dir.join("outgoing")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.transfers_dir())?;
        std::fs::create_dir_all(self.outgoing_dir())?;
        std::fs::create_dir_all(self.projects_dir())?;
        Ok(())
    }
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
