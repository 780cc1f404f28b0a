//! Server role: accepts connections and offers a project to each client.
//! Nothing is streamed until the client asks for the offered request.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use lan_peers::{DeviceClass, Peer, Request};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::handshake::{self, Session, MAX_FRAME};
use crate::keys::DeviceIdentity;
use crate::project::ProjectExporter;
use crate::protocol::Message;
use crate::session::{percent, Phase, Role, SessionClaim, SessionRegistry, TransferOutcome, TransferSession};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    PeerConnected(Peer),
    PeerChanged(Peer),
    RequestDeclined { peer: Peer, request_id: String },
    TransferSent { peer: Peer, project_id: String, bytes: u64 },
    SessionEnded { peer: Peer, outcome: TransferOutcome },
}

struct Shared {
    cfg: TransferConfig,
    identity: Arc<DeviceIdentity>,
    exporter: Arc<dyn ProjectExporter>,
    project_id: String,
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// Running accept loop. Dropping it stops accepting and cancels every
/// session it spawned.
pub struct TransferServer {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl TransferServer {
    pub async fn start(
        cfg: &TransferConfig,
        identity: Arc<DeviceIdentity>,
        exporter: Arc<dyn ProjectExporter>,
        project_id: impl Into<String>,
        registry: SessionRegistry,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), TransferError> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        let (events, rx) = mpsc::unbounded_channel();
        let project_id = project_id.into();
        tracing::info!("Offering {} on tcp {}", project_id, local_addr);

        let shared = Arc::new(Shared {
            cfg: cfg.clone(),
            identity,
            exporter,
            project_id,
            registry,
            events,
        });
        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, shared, token.clone()));

        Ok((
            Self {
                token,
                task: Some(task),
                local_addr,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TransferServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let claim = match shared.registry.claim(addr.ip(), Role::Server) {
                        Ok(claim) => claim,
                        Err(e) => {
                            tracing::warn!("Refusing connection from {}: {}", addr, e);
                            continue;
                        }
                    };
                    tokio::spawn(serve(stream, addr, claim, shared.clone(), token.child_token()));
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("Transfer server stopped");
}

async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    _claim: SessionClaim,
    shared: Arc<Shared>,
    token: CancellationToken,
) {
    let mut session = TransferSession::new(
        Role::Server,
        Peer::new(addr.ip().to_string(), addr, DeviceClass::Other),
    );

    let result = tokio::select! {
        _ = token.cancelled() => Err(TransferError::Cancelled),
        r = run(&mut session, stream, addr, &shared) => r,
    };
    let outcome = result.unwrap_or_else(|e| {
        session.fail(e.to_string());
        TransferOutcome::Failed {
            reason: e.to_string(),
        }
    });
    shared.emit(ServerEvent::SessionEnded {
        peer: session.peer().clone(),
        outcome,
    });
}

async fn run(
    session: &mut TransferSession,
    mut stream: TcpStream,
    addr: SocketAddr,
    shared: &Shared,
) -> Result<TransferOutcome, TransferError> {
    session.advance(Phase::Connected)?;
    shared.emit(ServerEvent::PeerConnected(session.peer().clone()));

    let keys = timeout(
        shared.cfg.connect_timeout,
        handshake::responder_handshake(&shared.identity, &mut stream),
    )
    .await
    .map_err(|_| TransferError::Timeout(addr))??;

    Message::Hello {
        alias: shared.cfg.alias.clone(),
        device: shared.cfg.device,
        fingerprint: shared.identity.fingerprint(),
    }
    .send(&keys, &mut stream)
    .await?;
    match Message::recv(&keys, &mut stream).await? {
        Message::Hello { alias, device, .. } => {
            let peer = session.peer_mut();
            peer.alias = alias;
            peer.device = device;
            tracing::info!("{} connected from {} ({})", peer.alias, addr, keys.peer_fingerprint());
            shared.emit(ServerEvent::PeerChanged(peer.clone()));
        }
        other => {
            return Err(TransferError::Unexpected {
                expected: "waiting for hello",
                got: other.name(),
            })
        }
    }

    let context = shared
        .exporter
        .describe(&shared.project_id)
        .await
        .map_err(TransferError::archive)?;
    let offer = Request::offer(context);
    session.set_project(shared.project_id.clone());
    Message::Request(offer.clone()).send(&keys, &mut stream).await?;
    session.advance(Phase::Offering)?;
    if session.peer_mut().status.set_waiting(true) {
        shared.emit(ServerEvent::PeerChanged(session.peer().clone()));
    }

    loop {
        let msg = match Message::recv(&keys, &mut stream).await {
            Ok(msg) => msg,
            Err(TransferError::Malformed(e)) => {
                tracing::warn!("Ignoring malformed message from {}: {}", addr, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        match msg {
            Message::RequestTranslation { request_id, .. } if request_id == offer.id => {
                session.advance(Phase::Transferring)?;
                let bytes = send_archive(session, &keys, &mut stream, shared, &offer).await?;
                session.advance(Phase::Completed)?;
                let _ = Message::Bye.send(&keys, &mut stream).await;

                shared.emit(ServerEvent::TransferSent {
                    peer: session.peer().clone(),
                    project_id: shared.project_id.clone(),
                    bytes,
                });
                return Ok(TransferOutcome::Sent {
                    project_id: shared.project_id.clone(),
                    bytes,
                });
            }
            Message::RequestTranslation { request_id, .. } => {
                Message::Unavailable {
                    request_id,
                    reason: "no such offer".to_string(),
                }
                .send(&keys, &mut stream)
                .await?;
            }
            Message::Decline { request_id } if request_id == offer.id => {
                session.peer_mut().status.set_waiting(false);
                tracing::info!("{} declined {}", session.peer().alias, shared.project_id);
                shared.emit(ServerEvent::RequestDeclined {
                    peer: session.peer().clone(),
                    request_id,
                });
                session.advance(Phase::Completed)?;
                let _ = Message::Bye.send(&keys, &mut stream).await;
                return Ok(TransferOutcome::Declined);
            }
            Message::Bye => {
                session.advance(Phase::Completed)?;
                return Ok(TransferOutcome::Declined);
            }
            other => tracing::debug!("Ignoring {} from {}", other.name(), addr),
        }
    }
}

/// Removes the exported archive once the session is done with it.
struct Outgoing(PathBuf);

impl Drop for Outgoing {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn send_archive(
    session: &mut TransferSession,
    keys: &Session,
    stream: &mut TcpStream,
    shared: &Shared,
    offer: &Request,
) -> Result<u64, TransferError> {
    let dir = shared.cfg.outgoing_dir();
    tokio::fs::create_dir_all(&dir).await?;
    let outgoing = Outgoing(dir.join(format!("{}.tar.gz", session.id())));

    if let Err(e) = shared.exporter.export(&shared.project_id, &outgoing.0).await {
        let _ = Message::Unavailable {
            request_id: offer.id.clone(),
            reason: format!("{e:#}"),
        }
        .send(keys, stream)
        .await;
        return Err(TransferError::archive(e));
    }
    let (len, sha256) = storage::sha256_file(&outgoing.0)
        .await
        .map_err(TransferError::archive)?;
    Message::Archive {
        request_id: offer.id.clone(),
        len,
        sha256,
    }
    .send(keys, stream)
    .await?;

    let mut file = tokio::fs::File::open(&outgoing.0).await?;
    let mut buf = vec![0u8; shared.cfg.chunk_size.clamp(1, MAX_FRAME - 1024)];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        keys.send_frame(stream, &buf[..n]).await?;
        sent += n as u64;
        if session.peer_mut().status.set_progress(percent(sent, len)) {
            shared.emit(ServerEvent::PeerChanged(session.peer().clone()));
        }
    }
    if sent != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("archive shrank while sending: {sent} of {len} bytes"),
        )
        .into());
    }

    session.peer_mut().status.set_waiting(false);
    tracing::info!("Sent {} ({} bytes) to {}", shared.project_id, sent, session.peer().alias);
    Ok(sent)
}
