//! Session handshake and encrypted framing.
//!
//! - Each side sends identity_pub || x25519_ephemeral_pub || nonce || sig, the
//!   signature covering x25519_ephemeral_pub || nonce under the identity key.
//! - The peer signature is verified before any key material is derived.
//! - HKDF-SHA256 over the X25519 shared secret, keyed by both nonces, yields
//!   the XChaCha20-Poly1305 key for every following frame.
//! - Frames are u32 big-endian length prefixed and capped at [`MAX_FRAME`].

use crate::keys::{self, DeviceIdentity};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use ed25519_dalek::Signature;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};
use zeroize::Zeroizing;

const PUBKEY_LEN: usize = 32;
const NONCE_LEN: usize = 32;
const SIG_LEN: usize = 64;
const HELLO_LEN: usize = PUBKEY_LEN * 2 + NONCE_LEN + SIG_LEN;
const XNONCE_LEN: usize = 24;
const KDF_INFO: &[u8] = b"tsync session v1";

pub const MAX_FRAME: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer message has {0} bytes, expected {HELLO_LEN}")]
    BadLength(usize),
    #[error("peer signature does not verify")]
    BadSignature,
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Keys of an established session. Shared between the read and write halves
/// of a split stream.
pub struct Session {
    aead: XChaCha20Poly1305,
    peer_identity: [u8; 32],
}

struct Offer {
    secret: EphemeralSecret,
    nonce: [u8; NONCE_LEN],
    message: Vec<u8>,
}

struct PeerOffer {
    identity: [u8; 32],
    x_pub: X25519Public,
    nonce: [u8; NONCE_LEN],
}

async fn write_lp<T: AsyncWrite + Unpin + Send>(transport: &mut T, data: &[u8]) -> std::io::Result<()> {
    transport.write_all(&(data.len() as u32).to_be_bytes()).await?;
    transport.write_all(data).await?;
    transport.flush().await?;
    Ok(())
}

async fn read_lp<T: AsyncRead + Unpin + Send>(transport: &mut T) -> std::io::Result<Vec<u8>> {
    let mut lenb = [0u8; 4];
    transport.read_exact(&mut lenb).await?;
    let len = u32::from_be_bytes(lenb) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    transport.read_exact(&mut buf).await?;
    Ok(buf)
}

fn offer(identity: &DeviceIdentity) -> Offer {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let x_pub = X25519Public::from(&secret);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut signed = Vec::with_capacity(PUBKEY_LEN + NONCE_LEN);
    signed.extend_from_slice(x_pub.as_bytes());
    signed.extend_from_slice(&nonce);
    let sig = identity.sign(&signed);

    let mut message = Vec::with_capacity(HELLO_LEN);
    message.extend_from_slice(&identity.public_key_bytes());
    message.extend_from_slice(&signed);
    message.extend_from_slice(&sig.to_bytes());
    Offer { secret, nonce, message }
}

fn parse_offer(buf: &[u8]) -> Result<PeerOffer, HandshakeError> {
    if buf.len() != HELLO_LEN {
        return Err(HandshakeError::BadLength(buf.len()));
    }
    let mut identity = [0u8; PUBKEY_LEN];
    identity.copy_from_slice(&buf[..PUBKEY_LEN]);
    let signed = &buf[PUBKEY_LEN..PUBKEY_LEN * 2 + NONCE_LEN];
    let mut sig = [0u8; SIG_LEN];
    sig.copy_from_slice(&buf[PUBKEY_LEN * 2 + NONCE_LEN..]);

    keys::verify(&identity, signed, &Signature::from_bytes(&sig))
        .map_err(|_| HandshakeError::BadSignature)?;

    let mut x_pub = [0u8; PUBKEY_LEN];
    x_pub.copy_from_slice(&signed[..PUBKEY_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&signed[PUBKEY_LEN..]);
    Ok(PeerOffer {
        identity,
        x_pub: X25519Public::from(x_pub),
        nonce,
    })
}

fn derive(
    ours: Offer,
    theirs: PeerOffer,
    initiator_nonce: &[u8; NONCE_LEN],
    responder_nonce: &[u8; NONCE_LEN],
) -> Result<Session, HandshakeError> {
    let shared = ours.secret.diffie_hellman(&theirs.x_pub);
    let salt = [&initiator_nonce[..], &responder_nonce[..]].concat();
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, &mut okm[..])
        .map_err(|_| HandshakeError::Crypto("HKDF expand failed".into()))?;

    let aead = XChaCha20Poly1305::new_from_slice(&okm[..])
        .map_err(|_| HandshakeError::Crypto("bad session key length".into()))?;
    Ok(Session {
        aead,
        peer_identity: theirs.identity,
    })
}

/// Connecting side.
pub async fn initiator_handshake<T>(
    identity: &DeviceIdentity,
    transport: &mut T,
) -> Result<Session, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ours = offer(identity);
    write_lp(transport, &ours.message).await?;

    let theirs = parse_offer(&read_lp(transport).await?)?;
    let (a, b) = (ours.nonce, theirs.nonce);
    derive(ours, theirs, &a, &b)
}

/// Accepting side.
pub async fn responder_handshake<T>(
    identity: &DeviceIdentity,
    transport: &mut T,
) -> Result<Session, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let theirs = parse_offer(&read_lp(transport).await?)?;

    let ours = offer(identity);
    write_lp(transport, &ours.message).await?;

    let (a, b) = (theirs.nonce, ours.nonce);
    derive(ours, theirs, &a, &b)
}

impl Session {
    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    pub fn peer_fingerprint(&self) -> String {
        keys::fingerprint_of(&self.peer_identity)
    }

    /// Seal and send one frame: nonce || ciphertext, with a random 24-byte
    /// nonce per frame.
    pub async fn send_frame<T: AsyncWrite + Unpin + Send>(
        &self,
        transport: &mut T,
        plaintext: &[u8],
    ) -> std::io::Result<()> {
        let mut nonce_bytes = [0u8; XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from(nonce_bytes);

        let mut frame = Vec::with_capacity(XNONCE_LEN + plaintext.len() + 16);
        frame.extend_from_slice(&nonce_bytes);
        let mut sealed = plaintext.to_vec();
        self.aead
            .encrypt_in_place(&nonce, b"", &mut sealed)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "aead encrypt failed"))?;
        frame.extend_from_slice(&sealed);

        write_lp(transport, &frame).await
    }

    pub async fn read_frame<T: AsyncRead + Unpin + Send>(&self, transport: &mut T) -> std::io::Result<Vec<u8>> {
        let frame = read_lp(transport).await?;
        if frame.len() < XNONCE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame too small",
            ));
        }
        let nonce = XNonce::from_slice(&frame[..XNONCE_LEN]);
        let mut plain = frame[XNONCE_LEN..].to_vec();
        self.aead
            .decrypt_in_place(nonce, b"", &mut plain)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "aead decrypt failed"))?;
        Ok(plain)
    }
}
