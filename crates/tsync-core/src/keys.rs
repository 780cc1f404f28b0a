use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Long-lived Ed25519 key of this device. Signs the ephemeral half of every
/// session handshake.
///
/// Stored as the raw 32-byte secret.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
}

impl DeviceIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn generate_and_store(path: &Path) -> Result<Self> {
        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let secret = Zeroizing::new(identity.signing_key.to_bytes());
        fs::write(path, &secret[..]).context("writing identity file")?;
        tracing::info!("Generated new identity at {:?}", path);
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = Zeroizing::new(fs::read(path).context("reading identity file")?);
        let bytes: [u8; 32] = data.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!("Invalid key file length: expected 32 bytes, got {}", data.len())
        })?;
        let signing_key = SigningKey::from_bytes(&bytes);
        tracing::debug!("Loaded identity from {:?}", path);
        Ok(Self { signing_key })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Short form shown next to a peer's alias.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

pub fn fingerprint_of(public_key: &[u8; 32]) -> String {
    hex::encode(&public_key[..8])
}

pub fn verify(
    public_key: &[u8; 32],
    msg: &[u8],
    sig: &Signature,
) -> Result<(), ed25519_dalek::SignatureError> {
    VerifyingKey::from_bytes(public_key)?.verify(msg, sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stored_identity_reloads_with_same_key() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("id").join("identity.key");

        let first = DeviceIdentity::load_or_generate(&path)?;
        let again = DeviceIdentity::load_or_generate(&path)?;
        assert_eq!(first.public_key_bytes(), again.public_key_bytes());
        assert_eq!(first.fingerprint().len(), 16);

        let sig = first.sign(b"x25519||nonce");
        assert!(verify(&again.public_key_bytes(), b"x25519||nonce", &sig).is_ok());
        assert!(verify(&again.public_key_bytes(), b"tampered", &sig).is_err());
        Ok(())
    }

    #[test]
    fn truncated_key_file_is_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("identity.key");
        fs::write(&path, [1u8; 10])?;
        assert!(DeviceIdentity::load(&path).is_err());
        Ok(())
    }
}
