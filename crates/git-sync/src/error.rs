//! Git sync error types.

use std::path::PathBuf;

use thiserror::Error;

/// Whether retrying the failed operation may succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Retryable,
    Permanent,
}

/// Hard failures. Expected outcomes (auth failure, missing remote, conflicts,
/// rejection) are reported as statuses, not errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("failed to open repository at {0}: {1}")]
    OpenRepo(PathBuf, #[source] git2::Error),

    #[error("repository at {0} has no working directory")]
    BareRepo(PathBuf),

    #[error("backup ref {0} not found")]
    NoBackup(&'static str),

    #[error("failed to push: {0}")]
    Push(#[source] git2::Error),

    #[error("ssh key error: {0}")]
    Keys(String),

    #[error("remote host refused {action}: {status} {body}")]
    Host {
        action: &'static str,
        status: u16,
        body: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

impl SyncError {
    pub fn transience(&self) -> Transience {
        match self {
            SyncError::Push(_) | SyncError::Http(_) | SyncError::Io(_) => Transience::Retryable,
            SyncError::Host { status, .. } if *status >= 500 => Transience::Retryable,

            SyncError::OpenRepo(_, _)
            | SyncError::BareRepo(_)
            | SyncError::NoBackup(_)
            | SyncError::Keys(_)
            | SyncError::Host { .. }
            | SyncError::Join(_)
            | SyncError::Git(_) => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_host_errors_are_retryable() {
        let busy = SyncError::Host {
            action: "create repository",
            status: 503,
            body: String::new(),
        };
        let denied = SyncError::Host {
            action: "create repository",
            status: 403,
            body: String::new(),
        };
        assert_eq!(busy.transience(), Transience::Retryable);
        assert_eq!(denied.transience(), Transience::Permanent);
        assert_eq!(SyncError::NoBackup("refs/x").transience(), Transience::Permanent);
    }
}
