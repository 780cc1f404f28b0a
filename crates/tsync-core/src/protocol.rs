//! Transfer protocol messages. Each message is one JSON object, tagged by
//! `type`, sealed in one encrypted frame. An `archive` header is followed by
//! raw frames carrying exactly `len` archive bytes.

use lan_peers::{DeviceClass, Request};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransferError;
use crate::handshake::Session;

/// On-disk format revision of exported projects produced by this build.
pub const PACKAGE_VERSION: u32 = 7;

pub fn is_supported(package_version: u32, max_supported: u32) -> bool {
    package_version <= max_supported
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Hello {
        alias: String,
        device: DeviceClass,
        fingerprint: String,
    },
    Request(Request),
    RequestTranslation {
        request_id: String,
        target_translation_id: String,
    },
    Decline {
        request_id: String,
    },
    Archive {
        request_id: String,
        len: u64,
        sha256: String,
    },
    Unavailable {
        request_id: String,
        reason: String,
    },
    Bye,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Request(_) => "request",
            Message::RequestTranslation { .. } => "request-translation",
            Message::Decline { .. } => "decline",
            Message::Archive { .. } => "archive",
            Message::Unavailable { .. } => "unavailable",
            Message::Bye => "bye",
        }
    }

    pub async fn send<W: AsyncWrite + Unpin + Send>(
        &self,
        session: &Session,
        writer: &mut W,
    ) -> Result<(), TransferError> {
        let bytes = serde_json::to_vec(self)?;
        session.send_frame(writer, &bytes).await?;
        tracing::trace!("sent {}", self.name());
        Ok(())
    }

    /// A frame that does not decode is `TransferError::Malformed`; the
    /// connection itself is still usable.
    pub async fn recv<R: AsyncRead + Unpin + Send>(
        session: &Session,
        reader: &mut R,
    ) -> Result<Message, TransferError> {
        let bytes = session.read_frame(reader).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lan_peers::RequestContext;
    use std::collections::BTreeMap;

    #[test]
    fn request_is_flattened_under_type_tag() -> anyhow::Result<()> {
        let req = Request::offer(RequestContext {
            target_translation_id: "en_mat_ulb".into(),
            project_name: "Matthew".into(),
            target_language_name: "English".into(),
            package_version: PACKAGE_VERSION,
            extra: BTreeMap::new(),
        });
        let json: serde_json::Value = serde_json::to_value(Message::Request(req.clone()))?;
        assert_eq!(json["type"], "request");
        assert_eq!(json["kind"], "offer-translation");
        assert_eq!(json["context"]["package_version"], PACKAGE_VERSION);

        let back: Message = serde_json::from_value(json)?;
        assert_eq!(back, Message::Request(req));
        Ok(())
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(serde_json::from_str::<Message>(r#"{"type":"teleport"}"#).is_err());
        let bye: Message = serde_json::from_str(r#"{"type":"bye"}"#).unwrap();
        assert_eq!(bye, Message::Bye);
    }

    #[test]
    fn newer_packages_are_unsupported() {
        assert!(is_supported(PACKAGE_VERSION, PACKAGE_VERSION));
        assert!(is_supported(3, PACKAGE_VERSION));
        assert!(!is_supported(PACKAGE_VERSION + 1, PACKAGE_VERSION));
    }
}
