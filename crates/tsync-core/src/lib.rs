//! Peer-to-peer transfer of translation projects between nearby devices.
//!
//! A device that offers a project runs a [`TransferServer`]; a device that
//! found it through discovery connects with a [`TransferClient`]. Every
//! connection starts with a signed key exchange and all traffic after it is
//! encrypted. The server only offers: nothing is sent until the client asks
//! for the project, and an offer with a newer package version is declined
//! without asking the user.

pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod keys;
pub mod project;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{ClientEvent, ClientHandle, TransferClient};
pub use config::TransferConfig;
pub use error::TransferError;
pub use keys::DeviceIdentity;
pub use project::{ImportReport, ProjectExporter, ProjectImporter, TarProjects};
pub use protocol::{Message, PACKAGE_VERSION};
pub use server::{ServerEvent, TransferServer};
pub use session::{Phase, Role, SessionRegistry, TransferOutcome, TransferSession};
