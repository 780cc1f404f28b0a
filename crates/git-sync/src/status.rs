use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A project id and the working copy of its repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub path: PathBuf,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStatus {
    UpToDate,
    /// Fetch failed for a reason we could not classify. Treated like
    /// success by the orchestrator.
    Unknown,
    AuthFailure,
    NoRemoteRepo,
    MergeConflicts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Ok,
    AuthFailure,
    /// Non-fast-forward or a policy rejection by the remote.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    Cloned,
    AuthFailure,
    NoRemoteRepo,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Conflicts are left in the index for classification.
    #[default]
    Recursive,
    /// Conflicting hunks resolve to the local side.
    Ours,
    /// Conflicting hunks resolve to the remote side.
    Theirs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub status: PullStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub status: PushStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOutcome {
    pub status: CloneStatus,
    pub detail: Option<String>,
}

impl PullOutcome {
    pub fn new(status: PullStatus) -> Self {
        Self { status, detail: None }
    }

    pub fn with_detail(status: PullStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

impl PushOutcome {
    pub fn new(status: PushStatus) -> Self {
        Self { status, detail: None }
    }

    pub fn with_detail(status: PushStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

impl CloneOutcome {
    pub fn new(status: CloneStatus, detail: Option<String>) -> Self {
        Self { status, detail }
    }
}

impl fmt::Display for PullStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullStatus::UpToDate => "up to date",
            PullStatus::Unknown => "unknown",
            PullStatus::AuthFailure => "authentication failed",
            PullStatus::NoRemoteRepo => "no remote repository",
            PullStatus::MergeConflicts => "merge conflicts",
        };
        f.write_str(s)
    }
}
