//! Merge conflict classification.
//!
//! After a merge the repository is inspected for unmerged index entries and
//! for conflict markers in tracked files. Paths that only hold project
//! metadata (manifest, license) are not translation content; if every
//! affected path is metadata the conflict is a false positive.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::Repository;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::repo;
use crate::status::ProjectRef;

const MARKER_START: &str = "<<<<<<<";
const MARKER_SEP: &str = "=======";
const MARKER_END: &str = ">>>>>>>";

const STAGE_SHIFT: u16 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Metadata files, relative to the project root. Entries ending in `/`
    /// match everything below that directory.
    pub metadata_paths: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            metadata_paths: vec![
                "manifest.json".to_string(),
                "LICENSE.md".to_string(),
                "LICENSE.txt".to_string(),
                ".gitignore".to_string(),
            ],
        }
    }
}

impl ClassifierConfig {
    pub fn is_metadata(&self, path: &str) -> bool {
        self.metadata_paths.iter().any(|m| match m.strip_suffix('/') {
            Some(dir) => path.starts_with(dir) && path[dir.len()..].starts_with('/'),
            None => path == m,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MergeVerdict {
    NoConflict {
        project_id: String,
    },
    Conflict {
        project_id: String,
        /// Translation units (content paths without extension) in conflict.
        units: Vec<String>,
    },
}

impl MergeVerdict {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeVerdict::Conflict { .. })
    }

    pub fn project_id(&self) -> &str {
        match self {
            MergeVerdict::NoConflict { project_id } | MergeVerdict::Conflict { project_id, .. } => {
                project_id
            }
        }
    }
}

/// Anything that can decide whether a merged project needs human review.
#[async_trait]
pub trait ConflictCheck: Send + Sync {
    async fn classify(&self, project: &ProjectRef) -> Result<MergeVerdict, SyncError>;
}

#[derive(Debug, Clone, Default)]
pub struct MergeConflictClassifier {
    config: ClassifierConfig,
}

impl MergeConflictClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Read-only inspection; running it twice on the same state gives the
    /// same verdict.
    pub fn classify_blocking(&self, path: &Path, project_id: &str) -> Result<MergeVerdict, SyncError> {
        let repo = repo::open(path)?;
        let affected = affected_paths(&repo)?;

        let units: Vec<String> = affected
            .iter()
            .filter(|p| !self.config.is_metadata(p))
            .map(|p| unit_of(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if units.is_empty() {
            if !affected.is_empty() {
                tracing::info!(
                    "{}: {} metadata-only conflict(s) ignored",
                    project_id,
                    affected.len()
                );
            }
            Ok(MergeVerdict::NoConflict {
                project_id: project_id.to_string(),
            })
        } else {
            tracing::warn!("{}: conflicts in {:?}", project_id, units);
            Ok(MergeVerdict::Conflict {
                project_id: project_id.to_string(),
                units,
            })
        }
    }
}

#[async_trait]
impl ConflictCheck for MergeConflictClassifier {
    async fn classify(&self, project: &ProjectRef) -> Result<MergeVerdict, SyncError> {
        let this = self.clone();
        let path: PathBuf = project.path.clone();
        let id = project.id.clone();
        tokio::task::spawn_blocking(move || this.classify_blocking(&path, &id)).await?
    }
}

/// Unmerged index paths plus tracked files whose content carries markers.
fn affected_paths(repo: &Repository) -> Result<BTreeSet<String>, SyncError> {
    let root = repo::workdir(repo)?;
    let index = repo.index()?;
    let mut out = BTreeSet::new();

    for entry in index.iter() {
        let path = String::from_utf8_lossy(&entry.path).into_owned();
        let stage = (entry.flags >> STAGE_SHIFT) & 0x3;
        if stage != 0 {
            out.insert(path);
            continue;
        }
        if out.contains(&path) {
            continue;
        }
        match std::fs::read(root.join(&path)) {
            Ok(bytes) if !bytes.contains(&0) => {
                if has_conflict_markers(&String::from_utf8_lossy(&bytes)) {
                    out.insert(path);
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// A start marker followed by a separator and an end marker, each at the
/// beginning of a line.
pub fn has_conflict_markers(text: &str) -> bool {
    let mut state = 0;
    for line in text.lines() {
        state = match state {
            0 if line.starts_with(MARKER_START) => 1,
            1 if line.starts_with(MARKER_SEP) => 2,
            2 if line.starts_with(MARKER_END) => return true,
            s => s,
        };
    }
    false
}

fn unit_of(path: &str) -> String {
    let p = Path::new(path);
    match (p.parent(), p.file_stem()) {
        (Some(parent), Some(stem)) if !parent.as_os_str().is_empty() => {
            format!("{}/{}", parent.display(), stem.to_string_lossy())
        }
        (_, Some(stem)) => stem.to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::fixtures::*;
    use crate::repo::{merge_commit, MergeResult};
    use crate::status::MergeStrategy;
    use tempfile::TempDir;

    fn merged(temp: &TempDir, edits: &[(&str, &str, &str)]) -> PathBuf {
        let ours = temp.path().join("ours");
        let (repo, their_oid) = diverged(&ours, &temp.path().join("theirs"), edits);
        let theirs = repo.find_annotated_commit(their_oid).unwrap();
        assert_eq!(
            merge_commit(&repo, &theirs, MergeStrategy::Recursive).unwrap(),
            MergeResult::Conflicted
        );
        ours
    }

    #[test]
    fn marker_detection_needs_all_three_markers_in_order() {
        assert!(has_conflict_markers("<<<<<<< HEAD\na\n=======\nb\n>>>>>>> theirs\n"));
        assert!(!has_conflict_markers("<<<<<<< HEAD\na\n"));
        assert!(!has_conflict_markers("=======\n<<<<<<<\n>>>>>>>\n"));
        assert!(!has_conflict_markers("plain verse text"));
    }

    #[test]
    fn metadata_matching() {
        let cfg = ClassifierConfig {
            metadata_paths: vec!["manifest.json".into(), ".tstudio/".into()],
        };
        assert!(cfg.is_metadata("manifest.json"));
        assert!(cfg.is_metadata(".tstudio/settings.json"));
        assert!(!cfg.is_metadata(".tstudiox/a"));
        assert!(!cfg.is_metadata("01/manifest.json"));
    }

    #[test]
    fn clean_repository_has_no_conflict() {
        let temp = TempDir::new().unwrap();
        let repo = init_repo(temp.path());
        write(&repo, "01/01.txt", "verse");
        commit(&repo, "base");

        let verdict = MergeConflictClassifier::default()
            .classify_blocking(temp.path(), "en_mat_ulb")
            .unwrap();
        assert_eq!(
            verdict,
            MergeVerdict::NoConflict {
                project_id: "en_mat_ulb".into()
            }
        );
    }

    #[test]
    fn metadata_only_conflict_is_false_positive() {
        let temp = TempDir::new().unwrap();
        let path = merged(&temp, &[("manifest.json", "{\"t\":1}\n", "{\"t\":2}\n")]);

        let verdict = MergeConflictClassifier::default()
            .classify_blocking(&path, "p")
            .unwrap();
        assert!(!verdict.is_conflict());
    }

    #[test]
    fn content_conflict_is_reported_by_unit_and_is_stable() {
        let temp = TempDir::new().unwrap();
        let path = merged(
            &temp,
            &[("manifest.json", "{\"t\":1}\n", "{\"t\":2}\n"), ("02/05.txt", "mine\n", "yours\n")],
        );
        let classifier = MergeConflictClassifier::default();

        let first = classifier.classify_blocking(&path, "p").unwrap();
        let second = classifier.classify_blocking(&path, "p").unwrap();
        assert_eq!(
            first,
            MergeVerdict::Conflict {
                project_id: "p".into(),
                units: vec!["02/05".into()]
            }
        );
        assert_eq!(first, second);
    }

    #[test]
    fn committed_markers_still_count() {
        let temp = TempDir::new().unwrap();
        let repo = init_repo(temp.path());
        write(&repo, "01/title.txt", "<<<<<<< HEAD\nA\n=======\nB\n>>>>>>> x\n");
        commit(&repo, "recorded conflict");

        let verdict = MergeConflictClassifier::default()
            .classify_blocking(temp.path(), "p")
            .unwrap();
        assert_eq!(verdict.project_id(), "p");
        assert!(verdict.is_conflict());
    }

    #[tokio::test]
    async fn async_classify_matches_blocking() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = merged(&temp, &[("01/01.txt", "a\n", "b\n")]);
        let project = ProjectRef::new("p", path.clone());
        let classifier = MergeConflictClassifier::default();

        let verdict = classifier.classify(&project).await?;
        assert_eq!(verdict, classifier.classify_blocking(&path, "p")?);
        Ok(())
    }
}
