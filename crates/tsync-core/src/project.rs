//! Project archives exchanged between devices: a gzip-compressed tar of the
//! project directory, history (`.git`) included, rooted at `<project_id>/`.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use git_sync::repo;
use git_sync::ClassifierConfig;
use lan_peers::RequestContext;

use crate::protocol::PACKAGE_VERSION;

/// Result of installing a received archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub project_id: String,
    pub path: PathBuf,
    /// A local copy existed; the received history was merged into it
    pub merged: bool,
}

#[async_trait]
pub trait ProjectExporter: Send + Sync {
    /// Offer context for a local project.
    async fn describe(&self, project_id: &str) -> Result<RequestContext>;

    /// Write the archive of `project_id` to `dest`.
    async fn export(&self, project_id: &str, dest: &Path) -> Result<()>;
}

#[async_trait]
pub trait ProjectImporter: Send + Sync {
    /// Install the archive. Callers hold the project lock.
    async fn import(&self, archive: &Path, project_id: &str) -> Result<ImportReport>;
}

/// Projects stored as git working copies under one root directory.
#[derive(Debug, Clone)]
pub struct TarProjects {
    root: PathBuf,
    metadata: ClassifierConfig,
}

impl TarProjects {
    pub fn new(root: PathBuf, metadata: ClassifierConfig) -> Self {
        Self { root, metadata }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_path(&self, project_id: &str) -> Result<PathBuf> {
        check_project_id(project_id)?;
        Ok(self.root.join(project_id))
    }

    fn describe_blocking(&self, project_id: &str) -> Result<RequestContext> {
        let dir = self.project_path(project_id)?;
        if !dir.is_dir() {
            bail!("project {} not found under {}", project_id, self.root.display());
        }

        let manifest: serde_json::Value = match fs::read(dir.join("manifest.json")) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => serde_json::Value::Null,
        };
        let text = |ptr: &str| manifest.pointer(ptr).and_then(|v| v.as_str()).map(str::to_string);

        Ok(RequestContext {
            target_translation_id: project_id.to_string(),
            project_name: text("/project/name").unwrap_or_else(|| project_id.to_string()),
            target_language_name: text("/target_language/name").unwrap_or_default(),
            package_version: manifest
                .pointer("/package_version")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(PACKAGE_VERSION),
            extra: Default::default(),
        })
    }

    fn export_blocking(&self, project_id: &str, dest: &Path) -> Result<()> {
        let dir = self.project_path(project_id)?;
        let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        builder
            .append_dir_all(project_id, &dir)
            .with_context(|| format!("archiving {}", dir.display()))?;
        builder.into_inner()?.finish()?;
        tracing::debug!("Exported {} to {}", project_id, dest.display());
        Ok(())
    }

    fn import_blocking(&self, archive: &Path, project_id: &str) -> Result<ImportReport> {
        let dest = self.project_path(project_id)?;
        fs::create_dir_all(&self.root)?;
        let scratch = Scratch::new(self.root.join(format!(".incoming-{}", uuid::Uuid::new_v4())))?;

        let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(&scratch.0)
            .context("unpacking project archive")?;

        let unpacked = scratch.0.join(project_id);
        if !unpacked.join(".git").is_dir() {
            bail!("archive does not contain a repository for {}", project_id);
        }

        if dest.join(".git").is_dir() {
            let result = repo::merge_from_path(&dest, &unpacked, |p| self.metadata.is_metadata(p))?;
            tracing::info!("Merged received {} into local copy: {:?}", project_id, result);
            return Ok(ImportReport {
                project_id: project_id.to_string(),
                path: dest,
                merged: true,
            });
        }

        if dest.exists() {
            bail!("{} exists and is not a project repository", dest.display());
        }
        fs::rename(&unpacked, &dest)
            .with_context(|| format!("installing project into {}", dest.display()))?;
        tracing::info!("Installed new project {}", project_id);
        Ok(ImportReport {
            project_id: project_id.to_string(),
            path: dest,
            merged: false,
        })
    }
}

#[async_trait]
impl ProjectExporter for TarProjects {
    async fn describe(&self, project_id: &str) -> Result<RequestContext> {
        let this = self.clone();
        let id = project_id.to_string();
        tokio::task::spawn_blocking(move || this.describe_blocking(&id)).await?
    }

    async fn export(&self, project_id: &str, dest: &Path) -> Result<()> {
        let this = self.clone();
        let id = project_id.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || this.export_blocking(&id, &dest)).await?
    }
}

#[async_trait]
impl ProjectImporter for TarProjects {
    async fn import(&self, archive: &Path, project_id: &str) -> Result<ImportReport> {
        let this = self.clone();
        let id = project_id.to_string();
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || this.import_blocking(&archive, &id)).await?
    }
}

/// Project ids name a single directory below the root.
fn check_project_id(id: &str) -> Result<()> {
    let mut parts = Path::new(id).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !id.starts_with('.') => Ok(()),
        _ => bail!("invalid project id {:?}", id),
    }
}

/// Directory removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn new(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", self.0.display(), e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn describe_reads_manifest() -> Result<()> {
        let temp = TempDir::new()?;
        project(temp.path(), "en_mat_ulb", &[("manifest.json", MANIFEST)]);
        let projects = TarProjects::new(temp.path().to_path_buf(), ClassifierConfig::default());

        let ctx = projects.describe("en_mat_ulb").await?;
        assert_eq!(ctx.project_name, "Matthew");
        assert_eq!(ctx.target_language_name, "English");
        assert_eq!(ctx.package_version, 7);

        assert!(projects.describe("missing").await.is_err());
        assert!(projects.describe("../etc").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn export_then_import_installs_new_project() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        project(src.path(), "en_mat_ulb", &[("manifest.json", MANIFEST), ("01/01.txt", "verse")]);

        let sender = TarProjects::new(src.path().to_path_buf(), ClassifierConfig::default());
        let receiver = TarProjects::new(dst.path().to_path_buf(), ClassifierConfig::default());
        let archive = src.path().join("out.tar.gz");
        sender.export("en_mat_ulb", &archive).await?;

        let report = receiver.import(&archive, "en_mat_ulb").await?;
        assert!(!report.merged);
        assert_eq!(fs::read_to_string(report.path.join("01/01.txt"))?, "verse");
        assert!(git2::Repository::open(&report.path).is_ok());

        let leftovers: Vec<_> = fs::read_dir(dst.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".incoming"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn import_over_existing_copy_merges() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let origin = project(src.path(), "p", &[("01/01.txt", "one\n")]);

        // receiver already has a clone with its own edit
        let local = dst.path().join("p");
        let local_repo = git2::Repository::clone(origin.to_str().unwrap(), &local)?;
        let mut cfg = local_repo.config()?;
        cfg.set_str("user.name", "Local")?;
        cfg.set_str("user.email", "local@test.com")?;
        fs::write(local.join("01/02.txt"), "two\n")?;
        repo::commit_all(&local_repo, "local edit")?;

        fs::write(origin.join("01/03.txt"), "three\n")?;
        repo::commit_all(&git2::Repository::open(&origin)?, "sender edit")?;

        let sender = TarProjects::new(src.path().to_path_buf(), ClassifierConfig::default());
        let archive = src.path().join("p.tar.gz");
        sender.export("p", &archive).await?;

        let receiver = TarProjects::new(dst.path().to_path_buf(), ClassifierConfig::default());
        let report = receiver.import(&archive, "p").await?;
        assert!(report.merged);
        assert!(local.join("01/02.txt").exists());
        assert!(local.join("01/03.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn archive_without_repository_is_refused() -> Result<()> {
        let temp = TempDir::new()?;
        let plain = temp.path().join("src").join("p");
        fs::create_dir_all(&plain)?;
        fs::write(plain.join("a.txt"), "a")?;

        let archive = temp.path().join("p.tar.gz");
        let file = File::create(&archive)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all("p", &plain)?;
        builder.into_inner()?.finish()?;

        let receiver = TarProjects::new(temp.path().join("dst"), ClassifierConfig::default());
        assert!(receiver.import(&archive, "p").await.is_err());
        assert!(!temp.path().join("dst").join("p").exists());
        Ok(())
    }
}
