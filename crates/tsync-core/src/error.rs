use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::handshake::HandshakeError;
use crate::session::Phase;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected {got} message while {expected}")]
    Unexpected { expected: &'static str, got: &'static str },

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("a session with {0} is already active")]
    PeerBusy(IpAddr),

    #[error("connecting to {0} timed out")]
    Timeout(SocketAddr),

    #[error("package version {found} is newer than supported {max}")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("no pending request {0}")]
    UnknownRequest(String),

    #[error("archive error: {0:#}")]
    Archive(anyhow::Error),

    #[error("sync error: {0}")]
    Sync(#[from] git_sync::SyncError),

    #[error("session cancelled")]
    Cancelled,

    #[error("session closed")]
    Closed,
}

impl TransferError {
    pub fn archive(e: anyhow::Error) -> Self {
        TransferError::Archive(e)
    }
}
