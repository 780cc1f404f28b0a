use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::SyncBackend;
use crate::conflict::{ConflictCheck, MergeVerdict};
use crate::error::SyncError;
use crate::host::RemoteHost;
use crate::keys::SshKeyProvider;
use crate::lock::ProjectLocks;
use crate::status::{
    CloneOutcome, CloneStatus, MergeStrategy, ProjectRef, PullStatus, PushStatus,
};

/// Final result of one sync call chain, after every retry the policy
/// allows has been spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced {
        server_url: String,
        /// What the pull that preceded the push reported.
        pull: PullStatus,
    },
    AuthFailure {
        detail: Option<String>,
    },
    NoRemoteRepo {
        detail: Option<String>,
    },
    MergeConflicts {
        project_id: String,
        units: Vec<String>,
    },
    /// The remote refused the push. Resolve with
    /// [`SyncOrchestrator::resolve_rejection`].
    Rejected {
        detail: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionChoice {
    /// Reset to the backup, merge the remote history, push if clean.
    Merge,
    /// Reset to the backup and let the remote side win every conflict.
    AcceptRemote,
}

/// Retry budget for one call chain.
#[derive(Debug, Default)]
struct Attempt {
    registered_keys: bool,
    created_repo: bool,
}

/// Pull-then-push synchronisation of a project with its remote backup.
pub struct SyncOrchestrator {
    backend: Arc<dyn SyncBackend>,
    host: Arc<dyn RemoteHost>,
    keys: Arc<dyn SshKeyProvider>,
    classifier: Arc<dyn ConflictCheck>,
    locks: ProjectLocks,
}

impl SyncOrchestrator {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        host: Arc<dyn RemoteHost>,
        keys: Arc<dyn SshKeyProvider>,
        classifier: Arc<dyn ConflictCheck>,
        locks: ProjectLocks,
    ) -> Self {
        Self {
            backend,
            host,
            keys,
            classifier,
            locks,
        }
    }

    pub fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    pub async fn sync(&self, project: &ProjectRef) -> Result<SyncOutcome, SyncError> {
        let _guard = self.locks.lock(&project.id).await;
        tracing::info!("Syncing {}", project.id);
        let mut attempt = Attempt::default();
        self.pull_then_push(project, MergeStrategy::Recursive, &mut attempt)
            .await
    }

    /// Answer a [`SyncOutcome::Rejected`]. The working copy is first reset
    /// to the backup ref written by the last pull.
    pub async fn resolve_rejection(
        &self,
        project: &ProjectRef,
        choice: RejectionChoice,
    ) -> Result<SyncOutcome, SyncError> {
        let _guard = self.locks.lock(&project.id).await;
        self.backend.reset_to_backup(project).await?;

        let strategy = match choice {
            RejectionChoice::Merge => MergeStrategy::Recursive,
            RejectionChoice::AcceptRemote => MergeStrategy::Theirs,
        };
        tracing::info!("Resolving rejected push of {} with {:?}", project.id, choice);
        let mut attempt = Attempt::default();
        self.pull_then_push(project, strategy, &mut attempt).await
    }

    pub async fn clone_project(&self, project_id: &str, dest: &Path) -> Result<CloneOutcome, SyncError> {
        let _guard = self.locks.lock(project_id).await;
        let url = self.host.repository_url(project_id);
        let mut attempt = Attempt::default();
        loop {
            let outcome = self.backend.clone_project(&url, dest).await?;
            if outcome.status != CloneStatus::AuthFailure || !self.register_keys(&mut attempt).await {
                return Ok(outcome);
            }
        }
    }

    async fn pull_then_push(
        &self,
        project: &ProjectRef,
        strategy: MergeStrategy,
        attempt: &mut Attempt,
    ) -> Result<SyncOutcome, SyncError> {
        let url = self.host.repository_url(&project.id);

        let pull = loop {
            let pull = self.backend.pull(project, &url, strategy).await?;
            tracing::debug!("Pull of {}: {}", project.id, pull.status);
            match pull.status {
                PullStatus::AuthFailure => {
                    if !self.register_keys(attempt).await {
                        return Ok(SyncOutcome::AuthFailure { detail: pull.detail });
                    }
                }
                PullStatus::NoRemoteRepo => {
                    if attempt.created_repo {
                        return Ok(SyncOutcome::NoRemoteRepo { detail: pull.detail });
                    }
                    attempt.created_repo = true;
                    self.host.create_repository(&project.id).await?;
                }
                _ => break pull,
            }
        };

        match pull.status {
            PullStatus::MergeConflicts => {
                let verdict = self.classifier.classify(project).await?;
                self.backend.conclude_merge(project).await?;
                if let MergeVerdict::Conflict { project_id, units } = verdict {
                    return Ok(SyncOutcome::MergeConflicts { project_id, units });
                }
            }
            PullStatus::Unknown => {
                tracing::warn!(
                    "Pull of {} ended in an unknown state ({}), pushing anyway",
                    project.id,
                    pull.detail.as_deref().unwrap_or("no detail")
                );
            }
            _ => {}
        }

        loop {
            let push = self.backend.push(project, &url).await?;
            match push.status {
                PushStatus::Ok => {
                    return Ok(SyncOutcome::Synced {
                        server_url: self.host.server_url(&project.id),
                        pull: pull.status,
                    });
                }
                PushStatus::AuthFailure => {
                    if !self.register_keys(attempt).await {
                        return Ok(SyncOutcome::AuthFailure { detail: push.detail });
                    }
                }
                PushStatus::Rejected => {
                    return Ok(SyncOutcome::Rejected { detail: push.detail });
                }
            }
        }
    }

    /// Spend the single registration of this call chain. Returns whether
    /// the caller should retry.
    async fn register_keys(&self, attempt: &mut Attempt) -> bool {
        if attempt.registered_keys {
            return false;
        }
        attempt.registered_keys = true;
        match self.try_register().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("SSH key registration failed: {}", e);
                false
            }
        }
    }

    async fn try_register(&self) -> Result<(), SyncError> {
        let keys = self.keys.clone();
        let public = tokio::task::spawn_blocking(move || -> Result<String, SyncError> {
            if !keys.has_keys() {
                keys.generate()?;
            }
            keys.public_key()
        })
        .await??;
        self.host.register_ssh_key(&public).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SshKeyPaths;
    use crate::status::{PullOutcome, PushOutcome};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[derive(Default)]
    struct ScriptedBackend {
        pulls: Mutex<VecDeque<PullStatus>>,
        pushes: Mutex<VecDeque<PushStatus>>,
        clones: Mutex<VecDeque<CloneStatus>>,
        log: Log,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(log: &Log, pulls: &[PullStatus], pushes: &[PushStatus]) -> Self {
            Self {
                pulls: Mutex::new(pulls.iter().copied().collect()),
                pushes: Mutex::new(pushes.iter().copied().collect()),
                log: log.clone(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl SyncBackend for ScriptedBackend {
        async fn pull(
            &self,
            project: &ProjectRef,
            _remote_url: &str,
            strategy: MergeStrategy,
        ) -> Result<PullOutcome, SyncError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = self.pulls.lock().unwrap().pop_front().unwrap_or(PullStatus::UpToDate);
            self.log
                .lock()
                .unwrap()
                .push(format!("pull {} {:?} -> {:?}", project.id, strategy, status));
            Ok(PullOutcome::new(status))
        }

        async fn push(&self, project: &ProjectRef, _remote_url: &str) -> Result<PushOutcome, SyncError> {
            let status = self.pushes.lock().unwrap().pop_front().unwrap_or(PushStatus::Ok);
            self.log
                .lock()
                .unwrap()
                .push(format!("push {} -> {:?}", project.id, status));
            Ok(PushOutcome::new(status))
        }

        async fn conclude_merge(&self, project: &ProjectRef) -> Result<(), SyncError> {
            self.log.lock().unwrap().push(format!("conclude {}", project.id));
            Ok(())
        }

        async fn reset_to_backup(&self, project: &ProjectRef) -> Result<(), SyncError> {
            self.log.lock().unwrap().push(format!("reset {}", project.id));
            Ok(())
        }

        async fn clone_project(&self, remote_url: &str, _dest: &Path) -> Result<CloneOutcome, SyncError> {
            let status = self.clones.lock().unwrap().pop_front().unwrap_or(CloneStatus::Cloned);
            self.log.lock().unwrap().push(format!("clone {} -> {:?}", remote_url, status));
            Ok(CloneOutcome::new(status, None))
        }
    }

    struct FakeHost {
        log: Log,
        refuse_keys: bool,
    }

    #[async_trait]
    impl RemoteHost for FakeHost {
        fn repository_url(&self, project_id: &str) -> String {
            format!("ssh://git@host/u/{project_id}.git")
        }

        fn server_url(&self, project_id: &str) -> String {
            format!("https://host/u/{project_id}")
        }

        async fn register_ssh_key(&self, public_key: &str) -> Result<(), SyncError> {
            self.log.lock().unwrap().push(format!("register {public_key}"));
            if self.refuse_keys {
                return Err(SyncError::Host {
                    action: "register ssh key",
                    status: 401,
                    body: "bad token".into(),
                });
            }
            Ok(())
        }

        async fn create_repository(&self, project_id: &str) -> Result<(), SyncError> {
            self.log.lock().unwrap().push(format!("create {project_id}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeKeys {
        generated: AtomicBool,
    }

    impl SshKeyProvider for FakeKeys {
        fn has_keys(&self) -> bool {
            self.generated.load(Ordering::SeqCst)
        }

        fn generate(&self) -> Result<(), SyncError> {
            self.generated.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn paths(&self) -> SshKeyPaths {
            SshKeyPaths {
                private: PathBuf::from("k"),
                public: PathBuf::from("k.pub"),
            }
        }

        fn public_key(&self) -> Result<String, SyncError> {
            Ok("ssh-ed25519 AAAA".into())
        }
    }

    struct FixedVerdict(Option<Vec<String>>);

    #[async_trait]
    impl ConflictCheck for FixedVerdict {
        async fn classify(&self, project: &ProjectRef) -> Result<MergeVerdict, SyncError> {
            Ok(match &self.0 {
                Some(units) => MergeVerdict::Conflict {
                    project_id: project.id.clone(),
                    units: units.clone(),
                },
                None => MergeVerdict::NoConflict {
                    project_id: project.id.clone(),
                },
            })
        }
    }

    struct Harness {
        orchestrator: SyncOrchestrator,
        backend: Arc<ScriptedBackend>,
        keys: Arc<FakeKeys>,
        log: Log,
    }

    fn harness_with(
        backend: impl FnOnce(&Log) -> ScriptedBackend,
        conflict_units: Option<Vec<String>>,
        refuse_keys: bool,
    ) -> Harness {
        let log: Log = Arc::default();
        let backend = Arc::new(backend(&log));
        let keys = Arc::new(FakeKeys::default());
        let orchestrator = SyncOrchestrator::new(
            backend.clone(),
            Arc::new(FakeHost {
                log: log.clone(),
                refuse_keys,
            }),
            keys.clone(),
            Arc::new(FixedVerdict(conflict_units)),
            ProjectLocks::new(),
        );
        Harness {
            orchestrator,
            backend,
            keys,
            log,
        }
    }

    fn harness(pulls: &[PullStatus], pushes: &[PushStatus]) -> Harness {
        harness_with(|log| ScriptedBackend::new(log, pulls, pushes), None, false)
    }

    fn project() -> ProjectRef {
        ProjectRef::new("en_mat_ulb", "/projects/en_mat_ulb")
    }

    #[tokio::test]
    async fn missing_remote_is_created_once_then_pushed() -> anyhow::Result<()> {
        let h = harness(&[PullStatus::NoRemoteRepo, PullStatus::UpToDate], &[PushStatus::Ok]);

        let outcome = h.orchestrator.sync(&project()).await?;
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                server_url: "https://host/u/en_mat_ulb".into(),
                pull: PullStatus::UpToDate
            }
        );
        assert_eq!(
            entries(&h.log),
            vec![
                "pull en_mat_ulb Recursive -> NoRemoteRepo",
                "create en_mat_ulb",
                "pull en_mat_ulb Recursive -> UpToDate",
                "push en_mat_ulb -> Ok",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn repository_creation_is_not_retried_twice() -> anyhow::Result<()> {
        let h = harness(&[PullStatus::NoRemoteRepo, PullStatus::NoRemoteRepo], &[]);

        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::NoRemoteRepo { .. }));
        let log = entries(&h.log);
        assert_eq!(log.iter().filter(|l| l.starts_with("create")).count(), 1);
        assert!(!log.iter().any(|l| l.starts_with("push")));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_push_then_merge_with_real_conflict_stops_before_push() -> anyhow::Result<()> {
        let h = harness_with(
            |log| {
                ScriptedBackend::new(
                    log,
                    &[PullStatus::UpToDate, PullStatus::MergeConflicts],
                    &[PushStatus::Rejected],
                )
            },
            Some(vec!["02/05".into()]),
            false,
        );
        let p = project();

        let first = h.orchestrator.sync(&p).await?;
        assert!(matches!(first, SyncOutcome::Rejected { .. }));

        let resolved = h.orchestrator.resolve_rejection(&p, RejectionChoice::Merge).await?;
        assert_eq!(
            resolved,
            SyncOutcome::MergeConflicts {
                project_id: "en_mat_ulb".into(),
                units: vec!["02/05".into()]
            }
        );
        assert_eq!(
            entries(&h.log),
            vec![
                "pull en_mat_ulb Recursive -> UpToDate",
                "push en_mat_ulb -> Rejected",
                "reset en_mat_ulb",
                "pull en_mat_ulb Recursive -> MergeConflicts",
                "conclude en_mat_ulb",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn accept_remote_pulls_with_theirs_and_pushes() -> anyhow::Result<()> {
        let h = harness(&[], &[]);
        let outcome = h
            .orchestrator
            .resolve_rejection(&project(), RejectionChoice::AcceptRemote)
            .await?;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(entries(&h.log)[1], "pull en_mat_ulb Theirs -> UpToDate");
        Ok(())
    }

    #[tokio::test]
    async fn key_registration_happens_at_most_once() -> anyhow::Result<()> {
        let h = harness(&[PullStatus::AuthFailure, PullStatus::AuthFailure], &[]);

        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::AuthFailure { .. }));
        assert!(h.keys.has_keys(), "keys generated before registering");
        let log = entries(&h.log);
        assert_eq!(log.iter().filter(|l| l.starts_with("register")).count(), 1);
        assert_eq!(log.iter().filter(|l| l.starts_with("pull")).count(), 2);
        assert!(!log.iter().any(|l| l.starts_with("push")));
        Ok(())
    }

    #[tokio::test]
    async fn failed_registration_ends_with_auth_failure() -> anyhow::Result<()> {
        let h = harness_with(
            |log| ScriptedBackend::new(log, &[PullStatus::AuthFailure], &[]),
            None,
            true,
        );
        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::AuthFailure { .. }));
        assert_eq!(entries(&h.log).iter().filter(|l| l.starts_with("pull")).count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn registration_budget_is_shared_by_pull_and_push() -> anyhow::Result<()> {
        let h = harness(
            &[PullStatus::AuthFailure, PullStatus::UpToDate],
            &[PushStatus::AuthFailure],
        );
        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::AuthFailure { .. }));

        let h = harness(&[], &[PushStatus::AuthFailure, PushStatus::Ok]);
        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_pull_proceeds_to_push() -> anyhow::Result<()> {
        let h = harness(&[PullStatus::Unknown], &[]);
        let outcome = h.orchestrator.sync(&project()).await?;
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                server_url: "https://host/u/en_mat_ulb".into(),
                pull: PullStatus::Unknown
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn metadata_only_conflict_is_concluded_and_pushed() -> anyhow::Result<()> {
        let h = harness(&[PullStatus::MergeConflicts], &[]);
        let outcome = h.orchestrator.sync(&project()).await?;
        assert!(matches!(outcome, SyncOutcome::Synced { .. }));
        assert_eq!(
            entries(&h.log)[1..],
            ["conclude en_mat_ulb".to_string(), "push en_mat_ulb -> Ok".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn push_only_follows_an_acceptable_pull() -> anyhow::Result<()> {
        let cases: &[(PullStatus, Option<Vec<String>>, bool)] = &[
            (PullStatus::UpToDate, None, true),
            (PullStatus::Unknown, None, true),
            (PullStatus::MergeConflicts, None, true),
            (PullStatus::MergeConflicts, Some(vec!["01/01".into()]), false),
        ];
        for (status, units, pushes) in cases {
            let status = *status;
            let h = harness_with(
                |log| ScriptedBackend::new(log, &[status], &[]),
                units.clone(),
                false,
            );
            h.orchestrator.sync(&project()).await?;
            let pushed = entries(&h.log).iter().any(|l| l.starts_with("push"));
            assert_eq!(pushed, *pushes, "pull {:?} / {:?}", status, units);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn syncs_of_one_project_are_serialized() -> anyhow::Result<()> {
        let h = harness_with(
            |log| ScriptedBackend {
                log: log.clone(),
                delay: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            None,
            false,
        );
        let orchestrator = Arc::new(h.orchestrator);
        let p = project();

        let a = tokio::spawn({
            let o = orchestrator.clone();
            let p = p.clone();
            async move { o.sync(&p).await }
        });
        let b = tokio::spawn({
            let o = orchestrator.clone();
            let p = p.clone();
            async move { o.sync(&p).await }
        });
        a.await??;
        b.await??;

        assert_eq!(h.backend.max_in_flight.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn clone_retries_once_after_registering_keys() -> anyhow::Result<()> {
        let h = harness_with(
            |log| ScriptedBackend {
                clones: Mutex::new(VecDeque::from([CloneStatus::AuthFailure, CloneStatus::Cloned])),
                log: log.clone(),
                ..Default::default()
            },
            None,
            false,
        );
        let outcome = h.orchestrator.clone_project("p", Path::new("/tmp/p")).await?;
        assert_eq!(outcome.status, CloneStatus::Cloned);
        assert_eq!(
            entries(&h.log),
            vec![
                "clone ssh://git@host/u/p.git -> AuthFailure",
                "register ssh-ed25519 AAAA",
                "clone ssh://git@host/u/p.git -> Cloned",
            ]
        );
        Ok(())
    }
}
