//! Local network peers: the peer/request model, a TTL roster, and the UDP
//! broadcast announcer and listener used to find devices without a directory.

pub mod announce;
pub mod config;
pub mod discover;
pub mod error;
pub mod model;
pub mod net;
pub mod roster;

pub use announce::Announcer;
pub use config::DiscoveryConfig;
pub use discover::{DiscoveryEvent, Listener};
pub use error::DiscoveryError;
pub use model::{DeviceClass, Peer, PeerStatus, Request, RequestContext, RequestKind, StatusValue};
pub use roster::{Roster, Upsert};
