use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Service name carried in every discovery datagram.
pub const SERVICE_NAME: &str = "tsync";

/// Highest discovery datagram version this build understands.
pub const DISCOVERY_VERSION: u32 = 1;

/// Largest announcement datagram sent or accepted.
pub const MAX_DATAGRAM: usize = 1024;

pub const STATUS_WAITING: &str = "waiting";
pub const STATUS_PROGRESS: &str = "progress";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    Tablet,
    #[default]
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phone" => Ok(DeviceClass::Phone),
            "tablet" => Ok(DeviceClass::Tablet),
            "other" => Ok(DeviceClass::Other),
            other => Err(format!("unknown device class: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// Free-form key/value status of a peer. `waiting` and `progress` are the
/// keys the transfer endpoints maintain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus(BTreeMap<String, StatusValue>);

impl PeerStatus {
    pub fn get(&self, key: &str) -> Option<&StatusValue> {
        self.0.get(key)
    }

    /// Returns true when the stored value actually changed.
    pub fn set(&mut self, key: impl Into<String>, value: StatusValue) -> bool {
        let key = key.into();
        if self.0.get(&key) == Some(&value) {
            return false;
        }
        self.0.insert(key, value);
        true
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.get(STATUS_WAITING), Some(StatusValue::Bool(true)))
    }

    pub fn set_waiting(&mut self, waiting: bool) -> bool {
        self.set(STATUS_WAITING, StatusValue::Bool(waiting))
    }

    pub fn progress(&self) -> u8 {
        match self.get(STATUS_PROGRESS) {
            Some(StatusValue::Int(p)) => (*p).clamp(0, 100) as u8,
            _ => 0,
        }
    }

    pub fn set_progress(&mut self, percent: u8) -> bool {
        self.set(STATUS_PROGRESS, StatusValue::Int(percent.min(100) as i64))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StatusValue)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    OfferTranslation,
    AlertTranslationAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub target_translation_id: String,
    pub project_name: String,
    pub target_language_name: String,
    pub package_version: u32,
    /// Anything else the sender chose to attach.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A message directed at a peer, queued until the local side dismisses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub kind: RequestKind,
    pub context: RequestContext,
}

impl Request {
    pub fn new(kind: RequestKind, context: RequestContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            context,
        }
    }

    pub fn offer(context: RequestContext) -> Self {
        Self::new(RequestKind::OfferTranslation, context)
    }
}

/// A remote device reachable for direct transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub alias: String,
    /// Transfer endpoint of the device (advertised TCP port).
    pub address: SocketAddr,
    pub device: DeviceClass,
    #[serde(default)]
    pub status: PeerStatus,
    #[serde(default)]
    requests: VecDeque<Request>,
}

impl Peer {
    pub fn new(alias: impl Into<String>, address: SocketAddr, device: DeviceClass) -> Self {
        Self {
            alias: alias.into(),
            address,
            device,
            status: PeerStatus::default(),
            requests: VecDeque::new(),
        }
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn find_request(&self, id: &str) -> Option<&Request> {
        self.requests.iter().find(|r| r.id == id)
    }

    /// Queue a request; a request with the same id replaces the old one in place.
    pub fn push_request(&mut self, request: Request) {
        match self.requests.iter_mut().find(|r| r.id == request.id) {
            Some(slot) => *slot = request,
            None => self.requests.push_back(request),
        }
    }

    pub fn dismiss_request(&mut self, id: &str) -> Option<Request> {
        let idx = self.requests.iter().position(|r| r.id == id)?;
        self.requests.remove(idx)
    }

    /// Whether the identifying fields differ (status and queue are ignored).
    pub fn identity_differs(&self, other: &Peer) -> bool {
        self.alias != other.alias || self.device != other.device || self.address != other.address
    }
}

/// Discovery datagram payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub service: String,
    pub version: u32,
    pub instance: String,
    pub alias: String,
    pub device: DeviceClass,
    pub port: u16,
}

impl Announcement {
    pub fn new(instance: &str, alias: &str, device: DeviceClass, port: u16) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            version: DISCOVERY_VERSION,
            instance: instance.to_string(),
            alias: alias.to_string(),
            device,
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(DiscoveryError::Oversized(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        let ann: Announcement = serde_json::from_slice(bytes)?;
        if ann.service != SERVICE_NAME {
            return Err(DiscoveryError::ForeignService(ann.service));
        }
        if ann.version > DISCOVERY_VERSION {
            return Err(DiscoveryError::UnsupportedVersion(ann.version));
        }
        Ok(ann)
    }

    /// Build the candidate peer; the address is the datagram source with the
    /// advertised TCP port.
    pub fn into_peer(self, source: IpAddr) -> Peer {
        Peer::new(self.alias, SocketAddr::new(source, self.port), self.device)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub is_loopback: bool,
    pub broadcast: Option<IpAddr>,
}
