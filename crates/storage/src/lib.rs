use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage for project archives received from peers.
///
/// Bytes are written to a staging file first; only a complete archive whose
/// hash matches is moved into the committed area, so an aborted transfer
/// never replaces anything already stored.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn stage(&self, transfer_id: &str) -> Result<StagedArchive>;
    async fn get(&self, id: &str) -> Result<Option<PathBuf>>;
    async fn remove(&self, id: &str) -> Result<bool>;
}

/// Local filesystem-based archive store.
#[derive(Clone)]
pub struct LocalArchiveStore {
    incoming_dir: PathBuf,
    archives_dir: PathBuf,
}

impl LocalArchiveStore {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let incoming_dir = base_dir.join("incoming");
        let archives_dir = base_dir.join("archives");
        std::fs::create_dir_all(&incoming_dir).context("Failed to create incoming directory")?;
        std::fs::create_dir_all(&archives_dir).context("Failed to create archives directory")?;

        Ok(Self {
            incoming_dir,
            archives_dir,
        })
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        // Use first 2 chars as subdirectory for better filesystem performance
        let prefix = &id[..2.min(id.len())];
        self.archives_dir.join(prefix).join(id)
    }
}

#[async_trait]
impl ArchiveStore for LocalArchiveStore {
    async fn stage(&self, transfer_id: &str) -> Result<StagedArchive> {
        let name: String = transfer_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self.incoming_dir.join(format!("{name}.part"));
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create staging file {}", path.display()))?;

        Ok(StagedArchive {
            path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            archives_dir: self.archives_dir.clone(),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<PathBuf>> {
        let path = self.archive_path(id);
        Ok(fs::try_exists(&path).await?.then_some(path))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let path = self.archive_path(id);
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }
        fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to remove archive {}", id))?;
        Ok(true)
    }
}

/// An archive being received. Dropping it without `commit` deletes the
/// partial file.
pub struct StagedArchive {
    path: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    written: u64,
    archives_dir: PathBuf,
}

impl StagedArchive {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("staged archive already closed"))?;
        file.write_all(data).await.context("Failed to write archive chunk")?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify length and hash, then move the archive into place. The
    /// returned path is `archives/<sha[..2]>/<sha>`.
    pub async fn commit(mut self, expected_len: u64, expected_sha256: &str) -> Result<PathBuf> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| anyhow::anyhow!("staged archive already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if self.written != expected_len {
            anyhow::bail!(
                "archive length mismatch: expected {} got {}",
                expected_len,
                self.written
            );
        }
        let actual = hex::encode(self.hasher.clone().finalize());
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            anyhow::bail!("archive hash mismatch: expected {} got {}", expected_sha256, actual);
        }

        let prefix = &actual[..2];
        let dest_dir = self.archives_dir.join(prefix);
        fs::create_dir_all(&dest_dir)
            .await
            .context("Failed to create archive subdirectory")?;
        let dest = dest_dir.join(&actual);
        fs::rename(&self.path, &dest)
            .await
            .with_context(|| format!("Failed to move archive into {}", dest.display()))?;

        tracing::debug!("Committed archive {} ({} bytes)", actual, self.written);
        // nothing left to clean up
        self.path = PathBuf::new();
        Ok(dest)
    }

    pub async fn discard(mut self) -> Result<()> {
        self.file.take();
        let path = std::mem::take(&mut self.path);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        tracing::debug!("Discarded staged archive {}", path.display());
        Ok(())
    }
}

impl Drop for StagedArchive {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove partial archive {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Hex SHA-256 of a file, streamed.
pub async fn sha256_file(path: &Path) -> Result<(u64, String)> {
    use tokio::io::AsyncReadExt;

    let mut f = fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut len = 0u64;
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        len += n as u64;
    }
    Ok((len, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_staged_archive_commit() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalArchiveStore::new(temp.path().to_path_buf())?;

        let data = b"project archive bytes";
        let mut staged = store.stage("transfer-1").await?;
        staged.write_chunk(&data[..7]).await?;
        staged.write_chunk(&data[7..]).await?;
        let part = staged.path().to_path_buf();

        let path = staged.commit(data.len() as u64, &sha(data)).await?;
        assert!(!part.exists());
        assert_eq!(std::fs::read(&path)?, data.to_vec());
        assert_eq!(store.get(&sha(data)).await?, Some(path));

        assert!(store.remove(&sha(data)).await?);
        assert_eq!(store.get(&sha(data)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_nothing_behind() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalArchiveStore::new(temp.path().to_path_buf())?;

        let mut staged = store.stage("transfer-2").await?;
        staged.write_chunk(b"truncated").await?;
        let part = staged.path().to_path_buf();

        let err = staged.commit(9, &sha(b"something else")).await;
        assert!(err.is_err());
        assert!(!part.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_stage_is_removed() -> Result<()> {
        let temp = TempDir::new()?;
        let store = LocalArchiveStore::new(temp.path().to_path_buf())?;

        let mut staged = store.stage("../escape").await?;
        staged.write_chunk(b"partial").await?;
        let part = staged.path().to_path_buf();
        assert!(part.starts_with(temp.path().join("incoming")));

        drop(staged);
        assert!(!part.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_sha256_file() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("a.bin");
        std::fs::write(&path, b"abc")?;
        let (len, digest) = sha256_file(&path).await?;
        assert_eq!(len, 3);
        assert_eq!(digest, sha(b"abc"));
        Ok(())
    }
}
