use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use crate::error::SyncError;

/// The git hosting service backing up projects.
///
/// Project ids map to repository URLs deterministically, and repository
/// creation is idempotent.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    fn repository_url(&self, project_id: &str) -> String;

    /// Human-facing location reported after a successful sync.
    fn server_url(&self, project_id: &str) -> String {
        self.repository_url(project_id)
    }

    async fn register_ssh_key(&self, public_key: &str) -> Result<(), SyncError>;

    async fn create_repository(&self, project_id: &str) -> Result<(), SyncError>;
}

/// Gogs/Gitea compatible host reached through its v1 HTTP API.
pub struct GogsHost {
    client: reqwest::Client,
    api_url: String,
    token: String,
    ssh_host: String,
    ssh_port: u16,
    user: String,
    key_title: String,
}

impl GogsHost {
    pub fn new(
        api_url: impl Into<String>,
        token: impl Into<String>,
        ssh_host: impl Into<String>,
        ssh_port: u16,
        user: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            ssh_host: ssh_host.into(),
            ssh_port,
            user: user.into(),
            key_title: "tsync".to_string(),
        }
    }

    pub fn with_key_title(mut self, title: impl Into<String>) -> Self {
        self.key_title = title.into();
        self
    }

    async fn post(&self, action: &'static str, path: &str, body: serde_json::Value) -> Result<(), SyncError> {
        let resp = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .header("Authorization", format!("token {}", self.token))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        // the host already has it
        if status == StatusCode::CONFLICT
            || (status == StatusCode::UNPROCESSABLE_ENTITY && text.to_lowercase().contains("already"))
            || (status == StatusCode::UNPROCESSABLE_ENTITY && text.to_lowercase().contains("been used"))
        {
            tracing::debug!("{}: already present on host", action);
            return Ok(());
        }
        Err(SyncError::Host {
            action,
            status: status.as_u16(),
            body: text,
        })
    }

    fn web_root(&self) -> String {
        self.api_url
            .strip_suffix("/api/v1")
            .unwrap_or(&self.api_url)
            .to_string()
    }
}

#[async_trait]
impl RemoteHost for GogsHost {
    fn repository_url(&self, project_id: &str) -> String {
        format!(
            "ssh://git@{}:{}/{}/{}.git",
            self.ssh_host, self.ssh_port, self.user, project_id
        )
    }

    fn server_url(&self, project_id: &str) -> String {
        format!("{}/{}/{}", self.web_root(), self.user, project_id)
    }

    async fn register_ssh_key(&self, public_key: &str) -> Result<(), SyncError> {
        tracing::info!("Registering SSH key with {}", self.api_url);
        self.post(
            "register ssh key",
            "/user/keys",
            json!({ "title": self.key_title, "key": public_key }),
        )
        .await
    }

    async fn create_repository(&self, project_id: &str) -> Result<(), SyncError> {
        tracing::info!("Creating remote repository {}/{}", self.user, project_id);
        self.post(
            "create repository",
            "/user/repos",
            json!({ "name": project_id, "description": "translation backup", "private": false }),
        )
        .await
    }
}

/// Bare repositories in a local (or mounted) directory, addressed with
/// `file://` URLs. No authentication.
#[derive(Debug, Clone)]
pub struct LocalHost {
    root: PathBuf,
}

impl LocalHost {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn repository_path(&self, project_id: &str) -> PathBuf {
        self.root.join(format!("{project_id}.git"))
    }
}

#[async_trait]
impl RemoteHost for LocalHost {
    fn repository_url(&self, project_id: &str) -> String {
        format!("file://{}", self.repository_path(project_id).display())
    }

    async fn register_ssh_key(&self, _public_key: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn create_repository(&self, project_id: &str) -> Result<(), SyncError> {
        let path = self.repository_path(project_id);
        tokio::task::spawn_blocking(move || -> Result<(), SyncError> {
            if git2::Repository::open_bare(&path).is_ok() {
                return Ok(());
            }
            std::fs::create_dir_all(&path)?;
            git2::Repository::init_bare(&path)?;
            tracing::info!("Created bare repository {}", path.display());
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn gogs_urls_follow_project_id() {
        let host = GogsHost::new("https://git.example.org/api/v1/", "t", "git.example.org", 22, "joel");
        assert_eq!(
            host.repository_url("en_mat_ulb"),
            "ssh://git@git.example.org:22/joel/en_mat_ulb.git"
        );
        assert_eq!(host.server_url("en_mat_ulb"), "https://git.example.org/joel/en_mat_ulb");
    }

    #[tokio::test]
    async fn local_repository_creation_is_idempotent() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let host = LocalHost::new(temp.path().to_path_buf());

        host.create_repository("p").await?;
        host.create_repository("p").await?;

        let repo = git2::Repository::open_bare(host.repository_path("p"))?;
        assert!(repo.is_bare());
        assert!(host.repository_url("p").starts_with("file://"));
        Ok(())
    }
}
