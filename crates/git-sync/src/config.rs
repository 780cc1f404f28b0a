use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::host::{GogsHost, LocalHost, RemoteHost};

/// Where project backups live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteConfig {
    Gogs {
        /// e.g. "https://git.example.org/api/v1"
        api_url: String,
        token: String,
        ssh_host: String,
        #[serde(default = "default_ssh_port")]
        ssh_port: u16,
        user: String,
    },
    Local {
        root: PathBuf,
    },
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig::Local {
            root: PathBuf::from("remote"),
        }
    }
}

impl RemoteConfig {
    pub fn host(&self, key_title: &str) -> Arc<dyn RemoteHost> {
        match self {
            RemoteConfig::Gogs {
                api_url,
                token,
                ssh_host,
                ssh_port,
                user,
            } => Arc::new(
                GogsHost::new(api_url, token, ssh_host, *ssh_port, user).with_key_title(key_title),
            ),
            RemoteConfig::Local { root } => Arc::new(LocalHost::new(root.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gogs_config_defaults_ssh_port() {
        let json = r#"{"kind":"gogs","api_url":"https://h/api/v1","token":"x","ssh_host":"h","user":"u"}"#;
        let cfg: RemoteConfig = serde_json::from_str(json).unwrap();
        match cfg {
            RemoteConfig::Gogs { ssh_port, .. } => assert_eq!(ssh_port, 22),
            other => panic!("unexpected {:?}", other),
        }
        let host = cfg.host("tsync");
        assert_eq!(host.repository_url("p"), "ssh://git@h:22/u/p.git");
    }
}
