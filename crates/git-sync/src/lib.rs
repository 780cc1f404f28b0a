//! Remote synchronisation of a project repository against its git-hosted
//! backup, plus the merge conflict classifier shared with peer imports.
//!
//! The orchestrator always pulls before it pushes:
//! - Pull: auto-save, fetch, back up HEAD, merge
//! - Auth failures get one SSH key registration per call
//! - A missing remote repository is created once
//! - Conflicts are classified; only metadata-only conflicts are pushed

pub mod backend;
pub mod config;
pub mod conflict;
pub mod error;
pub mod host;
pub mod keys;
pub mod lock;
pub mod orchestrator;
pub mod repo;
pub mod status;

pub use backend::{GitBackend, SyncBackend};
pub use config::RemoteConfig;
pub use conflict::{ClassifierConfig, ConflictCheck, MergeConflictClassifier, MergeVerdict};
pub use error::{SyncError, Transience};
pub use host::{GogsHost, LocalHost, RemoteHost};
pub use keys::{FileSshKeys, SshKeyPaths, SshKeyProvider};
pub use lock::{ProjectGuard, ProjectLocks};
pub use orchestrator::{RejectionChoice, SyncOrchestrator, SyncOutcome};
pub use status::{
    CloneOutcome, CloneStatus, MergeStrategy, ProjectRef, PullOutcome, PullStatus, PushOutcome,
    PushStatus,
};
