//! Repository helpers over git2 used by pull, import and conflict handling.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    AnnotatedCommit, FileFavor, IndexAddOption, MergeOptions, Oid, Repository, ResetType,
    Signature,
};

use crate::error::SyncError;
use crate::status::MergeStrategy;

/// Last known-good HEAD, written before any fetched history is merged.
pub const BACKUP_REF: &str = "refs/tsync/backup";

const INCOMING_PREFIX: &str = "refs/tsync/incoming";

/// Result of merging another commit into HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    UpToDate,
    FastForward(Oid),
    Merged(Oid),
    /// Conflicts are in the index and marked in the working tree; the merge
    /// is still in progress.
    Conflicted,
}

pub fn open(path: &Path) -> Result<Repository, SyncError> {
    Repository::open(path).map_err(|e| SyncError::OpenRepo(path.to_path_buf(), e))
}

pub fn workdir(repo: &Repository) -> Result<PathBuf, SyncError> {
    repo.workdir()
        .map(Path::to_path_buf)
        .ok_or_else(|| SyncError::BareRepo(repo.path().to_path_buf()))
}

pub fn signature(repo: &Repository) -> Result<Signature<'static>, SyncError> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now("tsync", "tsync@localhost")?),
    }
}

/// Name of the branch HEAD points at, even when it has no commits yet.
pub fn current_branch(repo: &Repository) -> Result<String, SyncError> {
    if let Ok(head) = repo.head() {
        if let Some(name) = head.shorthand() {
            return Ok(name.to_string());
        }
    }
    let head = repo.find_reference("HEAD")?;
    let target = head.symbolic_target().unwrap_or("refs/heads/master");
    Ok(target.trim_start_matches("refs/heads/").to_string())
}

/// Stage every change in the working tree (including deletions) and commit
/// it. Returns `None` when there was nothing to commit.
pub fn commit_all(repo: &Repository, message: &str) -> Result<Option<Oid>, SyncError> {
    let mut index = repo.index()?;
    index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"], None)?;
    index.write()?;
    let tree_oid = index.write_tree()?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    if let Some(ref p) = parent {
        if p.tree_id() == tree_oid {
            return Ok(None);
        }
    }

    let tree = repo.find_tree(tree_oid)?;
    let sig = signature(repo)?;
    let parents: Vec<_> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    tracing::debug!("Committed {} ({})", oid, message);
    Ok(Some(oid))
}

/// Point the backup ref at HEAD. No-op on an unborn branch.
pub fn write_backup(repo: &Repository) -> Result<Option<Oid>, SyncError> {
    let Some(oid) = repo.head().ok().and_then(|h| h.target()) else {
        return Ok(None);
    };
    repo.reference(BACKUP_REF, oid, true, "tsync: backup before merge")?;
    Ok(Some(oid))
}

/// Abort any in-progress merge and hard-reset the working copy to the
/// backup ref.
pub fn reset_to_backup(repo: &Repository) -> Result<Oid, SyncError> {
    let oid = repo
        .refname_to_id(BACKUP_REF)
        .map_err(|_| SyncError::NoBackup(BACKUP_REF))?;
    let commit = repo.find_commit(oid)?;
    repo.cleanup_state()?;
    repo.reset(
        commit.as_object(),
        ResetType::Hard,
        Some(CheckoutBuilder::new().force()),
    )?;
    tracing::info!("Reset working copy to backup {}", oid);
    Ok(oid)
}

/// Merge `theirs` into the current branch.
pub fn merge_commit(
    repo: &Repository,
    theirs: &AnnotatedCommit<'_>,
    strategy: MergeStrategy,
) -> Result<MergeResult, SyncError> {
    let (analysis, _) = repo.merge_analysis(&[theirs])?;
    let their_oid = theirs.id();

    if analysis.is_up_to_date() {
        return Ok(MergeResult::UpToDate);
    }

    if analysis.is_unborn() || analysis.is_fast_forward() {
        let refname = format!("refs/heads/{}", current_branch(repo)?);
        match repo.find_reference(&refname) {
            Ok(mut r) => {
                r.set_target(their_oid, "tsync: fast-forward")?;
            }
            Err(_) => {
                repo.reference(&refname, their_oid, true, "tsync: fast-forward")?;
            }
        }
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        return Ok(MergeResult::FastForward(their_oid));
    }

    let mut opts = MergeOptions::new();
    opts.file_favor(match strategy {
        MergeStrategy::Recursive => FileFavor::Normal,
        MergeStrategy::Ours => FileFavor::Ours,
        MergeStrategy::Theirs => FileFavor::Theirs,
    });
    let mut checkout = CheckoutBuilder::new();
    checkout.allow_conflicts(true).conflict_style_merge(true).force();
    repo.merge(&[theirs], Some(&mut opts), Some(&mut checkout))?;

    if repo.index()?.has_conflicts() {
        tracing::info!("Merge of {} left conflicts", their_oid);
        return Ok(MergeResult::Conflicted);
    }

    let oid = commit_merge(repo, &format!("Merge {}", their_oid))?;
    Ok(MergeResult::Merged(oid))
}

/// Finish an in-progress merge. Conflicted paths accepted by `take_ours`
/// resolve to the local version; every other conflicted path is recorded
/// as it stands in the working tree, conflict markers included.
pub fn conclude_merge(
    repo: &Repository,
    take_ours: impl Fn(&str) -> bool,
) -> Result<Oid, SyncError> {
    let root = workdir(repo)?;
    let mut index = repo.index()?;

    let mut conflicts = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            let path = String::from_utf8_lossy(&entry.path).into_owned();
            conflicts.push((path, conflict.our.map(|e| e.id)));
        }
    }

    for (path, ours) in conflicts {
        let rel = Path::new(&path);
        let abs = root.join(rel);
        if take_ours(&path) {
            match ours {
                Some(blob_id) => {
                    let blob = repo.find_blob(blob_id)?;
                    std::fs::write(&abs, blob.content())?;
                    index.add_path(rel)?;
                }
                None => {
                    if abs.exists() {
                        std::fs::remove_file(&abs)?;
                    }
                    index.remove_path(rel)?;
                }
            }
            tracing::debug!("Resolved {} to local version", path);
        } else if abs.exists() {
            index.add_path(rel)?;
        } else {
            index.remove_path(rel)?;
        }
    }
    index.write()?;

    commit_merge(repo, "Merge with conflicts recorded")
}

fn commit_merge(repo: &Repository, message: &str) -> Result<Oid, SyncError> {
    let mut index = repo.index()?;
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = signature(repo)?;

    let mut parents = vec![repo.head()?.peel_to_commit()?];
    let merge_head = repo.path().join("MERGE_HEAD");
    if merge_head.exists() {
        for line in std::fs::read_to_string(&merge_head)?.lines() {
            let line = line.trim();
            if !line.is_empty() {
                parents.push(repo.find_commit(Oid::from_str(line)?)?);
            }
        }
    }
    let parent_refs: Vec<_> = parents.iter().collect();

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
    repo.cleanup_state()?;
    Ok(oid)
}

/// Merge the history of another copy of the project (e.g. an unpacked peer
/// export) into the local repository. Conflicts are concluded with
/// `take_ours` so the repository is left committed; the caller classifies.
pub fn merge_from_path(
    local: &Path,
    incoming: &Path,
    take_ours: impl Fn(&str) -> bool,
) -> Result<MergeResult, SyncError> {
    let repo = open(local)?;
    commit_all(&repo, "Auto-save before import")?;

    let branch = current_branch(&open(incoming)?)?;
    let url = incoming.to_str().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("non utf-8 path {}", incoming.display()),
        )
    })?;
    let refspec = format!("+refs/heads/{branch}:{INCOMING_PREFIX}/{branch}");
    repo.remote_anonymous(url)?.fetch(&[refspec.as_str()], None, None)?;

    let oid = repo.refname_to_id(&format!("{INCOMING_PREFIX}/{branch}"))?;
    let theirs = repo.find_annotated_commit(oid)?;
    write_backup(&repo)?;

    let result = match merge_commit(&repo, &theirs, MergeStrategy::Recursive)? {
        MergeResult::Conflicted => {
            conclude_merge(&repo, take_ours)?;
            MergeResult::Conflicted
        }
        other => other,
    };
    Ok(result)
}
