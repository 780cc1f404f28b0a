use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed announcement: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("announcement for foreign service {0:?}")]
    ForeignService(String),

    #[error("unsupported discovery version {0}")]
    UnsupportedVersion(u32),

    #[error("announcement of {0} bytes exceeds the datagram limit")]
    Oversized(usize),
}
