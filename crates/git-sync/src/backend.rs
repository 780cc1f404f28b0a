//! Pull, push and clone against a remote, with failures classified into
//! the statuses the orchestrator acts on.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{
    Cred, ErrorClass, ErrorCode, FetchOptions, PushOptions, Remote, RemoteCallbacks, Repository,
    RepositoryState,
};

use crate::conflict::ClassifierConfig;
use crate::error::SyncError;
use crate::keys::SshKeyProvider;
use crate::repo::{self, MergeResult};
use crate::status::{
    CloneOutcome, CloneStatus, MergeStrategy, ProjectRef, PullOutcome, PullStatus, PushOutcome,
    PushStatus,
};

const REMOTE_NAME: &str = "origin";

/// libgit2 keeps asking for credentials while the server refuses them.
const MAX_CREDENTIAL_TRIES: u32 = 3;

/// Git operations the orchestrator sequences. Implementations must not
/// retry on their own; every expected failure comes back as a status.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn pull(
        &self,
        project: &ProjectRef,
        remote_url: &str,
        strategy: MergeStrategy,
    ) -> Result<PullOutcome, SyncError>;

    async fn push(&self, project: &ProjectRef, remote_url: &str) -> Result<PushOutcome, SyncError>;

    /// Commit an in-progress merge, taking the local side for metadata
    /// paths and recording conflict markers elsewhere.
    async fn conclude_merge(&self, project: &ProjectRef) -> Result<(), SyncError>;

    async fn reset_to_backup(&self, project: &ProjectRef) -> Result<(), SyncError>;

    async fn clone_project(&self, remote_url: &str, dest: &Path) -> Result<CloneOutcome, SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteFailure {
    Auth,
    NotFound,
    Rejected,
    Other,
}

fn classify_remote_error(e: &git2::Error) -> RemoteFailure {
    let msg = e.message().to_lowercase();
    match e.code() {
        ErrorCode::Auth => return RemoteFailure::Auth,
        ErrorCode::NotFastForward => return RemoteFailure::Rejected,
        _ => {}
    }
    if msg.contains("permission denied")
        || msg.contains("authentication")
        || msg.contains("publickey")
    {
        RemoteFailure::Auth
    } else if e.code() == ErrorCode::NotFound
        || msg.contains("could not find repository")
        || msg.contains("failed to resolve path")
        || msg.contains("does not exist")
        || msg.contains("repository not found")
        || msg.contains("not appear to be a git repository")
    {
        RemoteFailure::NotFound
    } else if msg.contains("non-fast-forward")
        || msg.contains("non-fastforward")
        || msg.contains("fetch first")
        || msg.contains("rejected")
    {
        RemoteFailure::Rejected
    } else {
        RemoteFailure::Other
    }
}

/// [`SyncBackend`] over libgit2, authenticating with the provided SSH keys.
#[derive(Clone)]
pub struct GitBackend {
    keys: Arc<dyn SshKeyProvider>,
    metadata: ClassifierConfig,
}

impl GitBackend {
    pub fn new(keys: Arc<dyn SshKeyProvider>, metadata: ClassifierConfig) -> Self {
        Self { keys, metadata }
    }

    fn callbacks<'a>(&self) -> RemoteCallbacks<'a> {
        let paths = self.keys.paths();
        let have_files = self.keys.has_keys();
        let mut tries = 0u32;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username, allowed| {
            tries += 1;
            if tries > MAX_CREDENTIAL_TRIES {
                return Err(git2::Error::new(
                    ErrorCode::Auth,
                    ErrorClass::Ssh,
                    "authentication failed: ssh key rejected",
                ));
            }
            let user = username.unwrap_or("git");
            if allowed.is_username() {
                return Cred::username(user);
            }
            if allowed.is_ssh_key() {
                if have_files {
                    return Cred::ssh_key(user, Some(&paths.public), &paths.private, None);
                }
                return Cred::ssh_key_from_agent(user);
            }
            Cred::default()
        });
        callbacks
    }

    fn pull_blocking(
        &self,
        path: &Path,
        url: &str,
        strategy: MergeStrategy,
    ) -> Result<PullOutcome, SyncError> {
        let repo = repo::open(path)?;
        if repo::commit_all(&repo, "Auto-save before sync")?.is_some() {
            tracing::debug!("Saved pending changes in {}", path.display());
        }

        let branch = repo::current_branch(&repo)?;
        let tracking = format!("refs/remotes/{REMOTE_NAME}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking}");

        let mut remote = ensure_origin(&repo, url)?;
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(self.callbacks());
        if let Err(e) = remote.fetch(&[refspec.as_str()], Some(&mut fo), None) {
            let status = match classify_remote_error(&e) {
                RemoteFailure::Auth => PullStatus::AuthFailure,
                RemoteFailure::NotFound => PullStatus::NoRemoteRepo,
                RemoteFailure::Rejected | RemoteFailure::Other => {
                    tracing::warn!("Fetch from {} failed: {}", url, e);
                    PullStatus::Unknown
                }
            };
            return Ok(PullOutcome::with_detail(status, e.message()));
        }

        let oid = match repo.refname_to_id(&tracking) {
            Ok(oid) => oid,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Ok(PullOutcome::with_detail(
                    PullStatus::UpToDate,
                    "remote has no history yet",
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let theirs = repo.find_annotated_commit(oid)?;
        repo::write_backup(&repo)?;

        let outcome = match repo::merge_commit(&repo, &theirs, strategy)? {
            MergeResult::UpToDate => PullOutcome::new(PullStatus::UpToDate),
            MergeResult::FastForward(oid) => {
                PullOutcome::with_detail(PullStatus::UpToDate, format!("fast-forwarded to {oid}"))
            }
            MergeResult::Merged(oid) => {
                PullOutcome::with_detail(PullStatus::UpToDate, format!("merged into {oid}"))
            }
            MergeResult::Conflicted => PullOutcome::new(PullStatus::MergeConflicts),
        };
        Ok(outcome)
    }

    fn push_blocking(&self, path: &Path, url: &str) -> Result<PushOutcome, SyncError> {
        let repo = repo::open(path)?;
        if repo.head().is_err() {
            return Ok(PushOutcome::with_detail(PushStatus::Ok, "nothing to push"));
        }
        let branch = repo::current_branch(&repo)?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut remote = ensure_origin(&repo, url)?;

        let refused: RefCell<Option<String>> = RefCell::new(None);
        {
            let mut callbacks = self.callbacks();
            callbacks.push_update_reference(|_ref_name, status| {
                if let Some(msg) = status {
                    *refused.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut po = PushOptions::new();
            po.remote_callbacks(callbacks);

            if let Err(e) = remote.push(&[refspec.as_str()], Some(&mut po)) {
                return match classify_remote_error(&e) {
                    RemoteFailure::Auth => {
                        Ok(PushOutcome::with_detail(PushStatus::AuthFailure, e.message()))
                    }
                    RemoteFailure::Rejected => {
                        Ok(PushOutcome::with_detail(PushStatus::Rejected, e.message()))
                    }
                    RemoteFailure::NotFound | RemoteFailure::Other => Err(SyncError::Push(e)),
                };
            }
        }

        if let Some(msg) = refused.into_inner() {
            tracing::warn!("Remote refused {}: {}", branch, msg);
            return Ok(PushOutcome::with_detail(PushStatus::Rejected, msg));
        }
        tracing::info!("Pushed {} to {}", branch, url);
        Ok(PushOutcome::new(PushStatus::Ok))
    }

    fn conclude_blocking(&self, path: &Path) -> Result<(), SyncError> {
        let repo = repo::open(path)?;
        if repo.state() != RepositoryState::Merge {
            return Ok(());
        }
        let oid = repo::conclude_merge(&repo, |p| self.metadata.is_metadata(p))?;
        tracing::info!("Concluded merge in {} as {}", path.display(), oid);
        Ok(())
    }

    fn clone_blocking(&self, url: &str, dest: &Path) -> CloneOutcome {
        let mut fo = FetchOptions::new();
        fo.remote_callbacks(self.callbacks());
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fo);

        match builder.clone(url, dest) {
            Ok(_) => {
                tracing::info!("Cloned {} into {}", url, dest.display());
                CloneOutcome::new(CloneStatus::Cloned, None)
            }
            Err(e) => {
                let status = match classify_remote_error(&e) {
                    RemoteFailure::Auth => CloneStatus::AuthFailure,
                    RemoteFailure::NotFound => CloneStatus::NoRemoteRepo,
                    RemoteFailure::Rejected | RemoteFailure::Other => CloneStatus::Failed,
                };
                CloneOutcome::new(status, Some(e.message().to_string()))
            }
        }
    }
}

fn ensure_origin<'r>(repo: &'r Repository, url: &str) -> Result<Remote<'r>, SyncError> {
    match repo.find_remote(REMOTE_NAME) {
        Ok(remote) if remote.url() == Some(url) => Ok(remote),
        Ok(_) => {
            repo.remote_set_url(REMOTE_NAME, url)?;
            Ok(repo.find_remote(REMOTE_NAME)?)
        }
        Err(_) => Ok(repo.remote(REMOTE_NAME, url)?),
    }
}

#[async_trait]
impl SyncBackend for GitBackend {
    async fn pull(
        &self,
        project: &ProjectRef,
        remote_url: &str,
        strategy: MergeStrategy,
    ) -> Result<PullOutcome, SyncError> {
        let this = self.clone();
        let path = project.path.clone();
        let url = remote_url.to_string();
        tokio::task::spawn_blocking(move || this.pull_blocking(&path, &url, strategy)).await?
    }

    async fn push(&self, project: &ProjectRef, remote_url: &str) -> Result<PushOutcome, SyncError> {
        let this = self.clone();
        let path = project.path.clone();
        let url = remote_url.to_string();
        tokio::task::spawn_blocking(move || this.push_blocking(&path, &url)).await?
    }

    async fn conclude_merge(&self, project: &ProjectRef) -> Result<(), SyncError> {
        let this = self.clone();
        let path = project.path.clone();
        tokio::task::spawn_blocking(move || this.conclude_blocking(&path)).await?
    }

    async fn reset_to_backup(&self, project: &ProjectRef) -> Result<(), SyncError> {
        let path = project.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SyncError> {
            let repo = repo::open(&path)?;
            repo::reset_to_backup(&repo)?;
            Ok(())
        })
        .await?
    }

    async fn clone_project(&self, remote_url: &str, dest: &Path) -> Result<CloneOutcome, SyncError> {
        let this = self.clone();
        let url = remote_url.to_string();
        let dest: PathBuf = dest.to_path_buf();
        Ok(tokio::task::spawn_blocking(move || this.clone_blocking(&url, &dest)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{LocalHost, RemoteHost};
    use crate::keys::FileSshKeys;
    use crate::repo::fixtures::*;
    use tempfile::TempDir;

    fn backend(temp: &TempDir) -> GitBackend {
        let keys = FileSshKeys::new(temp.path().join("keys"), "test");
        GitBackend::new(Arc::new(keys), ClassifierConfig::default())
    }

    #[test]
    fn remote_errors_are_classified() {
        let auth = git2::Error::new(ErrorCode::Auth, ErrorClass::Ssh, "nope");
        assert_eq!(classify_remote_error(&auth), RemoteFailure::Auth);

        let denied = git2::Error::from_str("ERROR: Permission denied (publickey).");
        assert_eq!(classify_remote_error(&denied), RemoteFailure::Auth);

        let missing = git2::Error::from_str("could not find repository at '/srv/x.git'");
        assert_eq!(classify_remote_error(&missing), RemoteFailure::NotFound);

        let nff = git2::Error::new(
            ErrorCode::NotFastForward,
            ErrorClass::Reference,
            "cannot push non-fastforward reference",
        );
        assert_eq!(classify_remote_error(&nff), RemoteFailure::Rejected);

        let other = git2::Error::from_str("connection reset by peer");
        assert_eq!(classify_remote_error(&other), RemoteFailure::Other);
    }

    #[tokio::test]
    async fn missing_remote_then_created_then_pushed() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let host = LocalHost::new(temp.path().join("remote"));
        let local = temp.path().join("en_mat_ulb");
        let repo = init_repo(&local);
        write(&repo, "01/01.txt", "verse one\n");
        commit(&repo, "start");

        let project = ProjectRef::new("en_mat_ulb", &local);
        let url = host.repository_url(&project.id);
        let backend = backend(&temp);

        let pulled = backend.pull(&project, &url, MergeStrategy::Recursive).await?;
        assert_eq!(pulled.status, PullStatus::NoRemoteRepo);

        host.create_repository(&project.id).await?;
        let pulled = backend.pull(&project, &url, MergeStrategy::Recursive).await?;
        assert_eq!(pulled.status, PullStatus::UpToDate);

        let pushed = backend.push(&project, &url).await?;
        assert_eq!(pushed.status, PushStatus::Ok);

        let bare = Repository::open_bare(host.repository_path(&project.id))?;
        assert_eq!(
            bare.refname_to_id(&format!("refs/heads/{}", repo::current_branch(&repo)?))?,
            repo.head()?.target().unwrap()
        );
        Ok(())
    }

    #[tokio::test]
    async fn stale_copy_is_rejected_then_conflicts_on_pull() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let host = LocalHost::new(temp.path().join("remote"));
        host.create_repository("p").await?;
        let url = host.repository_url("p");
        let backend = backend(&temp);

        let a_dir = temp.path().join("a");
        let a = init_repo(&a_dir);
        write(&a, "01/01.txt", "base\n");
        commit(&a, "base");
        let a_project = ProjectRef::new("p", &a_dir);
        assert_eq!(backend.push(&a_project, &url).await?.status, PushStatus::Ok);

        let b_dir = temp.path().join("b");
        let cloned = backend.clone_project(&url, &b_dir).await?;
        assert_eq!(cloned.status, CloneStatus::Cloned);
        let b = Repository::open(&b_dir)?;
        let mut cfg = b.config()?;
        cfg.set_str("user.name", "Other")?;
        cfg.set_str("user.email", "other@test.com")?;
        write(&b, "01/01.txt", "theirs\n");
        commit(&b, "theirs");
        let b_project = ProjectRef::new("p", &b_dir);
        assert_eq!(backend.push(&b_project, &url).await?.status, PushStatus::Ok);

        write(&a, "01/01.txt", "ours\n");
        commit(&a, "ours");
        assert_eq!(backend.push(&a_project, &url).await?.status, PushStatus::Rejected);

        let pulled = backend.pull(&a_project, &url, MergeStrategy::Recursive).await?;
        assert_eq!(pulled.status, PullStatus::MergeConflicts);

        backend.conclude_merge(&a_project).await?;
        assert_eq!(a.state(), RepositoryState::Clean);

        backend.reset_to_backup(&a_project).await?;
        let text = std::fs::read_to_string(a_dir.join("01/01.txt"))?;
        assert_eq!(text, "ours\n");
        Ok(())
    }

    #[tokio::test]
    async fn clone_of_missing_repository_reports_no_remote() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let host = LocalHost::new(temp.path().join("remote"));
        let outcome = backend(&temp)
            .clone_project(&host.repository_url("absent"), &temp.path().join("dest"))
            .await?;
        assert_eq!(outcome.status, CloneStatus::NoRemoteRepo);
        Ok(())
    }
}
