//! Client role: connects to a discovered peer, surfaces its offers and, once
//! one is accepted, receives the archive and imports the project.
//!
//! Each connection runs in its own task. The socket is split: a reader task
//! turns frames into [`Inbound`] items (raw chunks after an `archive` header,
//! messages otherwise) while the session task reacts to them and to user
//! commands sent through the [`ClientHandle`].

use std::net::SocketAddr;
use std::sync::Arc;

use git_sync::{ConflictCheck, MergeVerdict, ProjectLocks, ProjectRef};
use lan_peers::{Peer, Request};
use storage::ArchiveStore;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::handshake::{self, Session};
use crate::keys::DeviceIdentity;
use crate::project::{ImportReport, ProjectImporter};
use crate::protocol::{is_supported, Message};
use crate::session::{percent, Phase, Role, SessionClaim, SessionRegistry, TransferOutcome, TransferSession};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PeerChanged(Peer),
    /// An offer waiting for [`ClientHandle::accept`] or [`ClientHandle::decline`]
    RequestReceived { peer: Peer, request: Request },
    /// An offer with a newer package version; already declined
    UnsupportedVersion { peer: Peer, request: Request },
    Progress { peer: Peer, received: u64, total: u64 },
    Completed {
        peer: Peer,
        report: ImportReport,
        verdict: Option<MergeVerdict>,
    },
    SessionEnded { peer: Peer, outcome: TransferOutcome },
}

#[derive(Debug)]
enum Command {
    Accept(String),
    Decline(String),
    Cancel,
}

#[derive(Debug)]
enum Inbound {
    Message(Message),
    Chunk(Vec<u8>),
    Closed(String),
}

struct Shared {
    cfg: TransferConfig,
    identity: Arc<DeviceIdentity>,
    store: Arc<dyn ArchiveStore>,
    importer: Arc<dyn ProjectImporter>,
    classifier: Arc<dyn ConflictCheck>,
    locks: ProjectLocks,
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<ClientEvent>,
    token: CancellationToken,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Clone)]
pub struct TransferClient {
    inner: Arc<Shared>,
}

impl TransferClient {
    pub fn new(
        cfg: &TransferConfig,
        identity: Arc<DeviceIdentity>,
        store: Arc<dyn ArchiveStore>,
        importer: Arc<dyn ProjectImporter>,
        classifier: Arc<dyn ConflictCheck>,
        locks: ProjectLocks,
        registry: SessionRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Shared {
            cfg: cfg.clone(),
            identity,
            store,
            importer,
            classifier,
            locks,
            registry,
            events,
            token: CancellationToken::new(),
        });
        (Self { inner }, rx)
    }

    /// Open a session with `peer`. Fails with `PeerBusy` while another
    /// session with the same peer is live.
    pub async fn connect(&self, peer: Peer) -> Result<ClientHandle, TransferError> {
        let shared = &self.inner;
        let claim = shared.registry.claim(peer.address.ip(), Role::Client)?;
        let mut session = TransferSession::new(Role::Client, peer);
        session.advance(Phase::Connecting)?;

        let (keys, stream) = match open(shared, &mut session).await {
            Ok(opened) => opened,
            Err(e) => {
                session.fail(e.to_string());
                shared.emit(ClientEvent::SessionEnded {
                    peer: session.peer().clone(),
                    outcome: TransferOutcome::Failed {
                        reason: e.to_string(),
                    },
                });
                return Err(e);
            }
        };
        session.advance(Phase::AwaitingRequest)?;

        let peer = session.peer().clone();
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            shared.clone(),
            session,
            Arc::new(keys),
            stream,
            rx,
            shared.token.child_token(),
            claim,
        ));
        Ok(ClientHandle {
            peer,
            commands,
            task,
        })
    }

    /// Cancel every live session.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }
}

/// Control over one client session. Dropping it cancels the session.
pub struct ClientHandle {
    peer: Peer,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<TransferOutcome>,
}

impl ClientHandle {
    /// The peer as it introduced itself.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn accept(&self, request_id: &str) -> Result<(), TransferError> {
        self.commands
            .send(Command::Accept(request_id.to_string()))
            .map_err(|_| TransferError::Closed)
    }

    pub fn decline(&self, request_id: &str) -> Result<(), TransferError> {
        self.commands
            .send(Command::Decline(request_id.to_string()))
            .map_err(|_| TransferError::Closed)
    }

    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    pub async fn finished(self) -> TransferOutcome {
        let ClientHandle { commands, task, .. } = self;
        let outcome = task.await.unwrap_or_else(|e| TransferOutcome::Failed {
            reason: e.to_string(),
        });
        drop(commands);
        outcome
    }
}

async fn open(shared: &Shared, session: &mut TransferSession) -> Result<(Session, TcpStream), TransferError> {
    let addr: SocketAddr = session.peer().address;
    let limit = shared.cfg.connect_timeout;

    let mut stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::Timeout(addr))??;
    stream.set_nodelay(true)?;
    let keys = timeout(limit, handshake::initiator_handshake(&shared.identity, &mut stream))
        .await
        .map_err(|_| TransferError::Timeout(addr))??;

    Message::Hello {
        alias: shared.cfg.alias.clone(),
        device: shared.cfg.device,
        fingerprint: shared.identity.fingerprint(),
    }
    .send(&keys, &mut stream)
    .await?;
    match timeout(limit, Message::recv(&keys, &mut stream))
        .await
        .map_err(|_| TransferError::Timeout(addr))??
    {
        Message::Hello { alias, device, .. } => {
            session.advance(Phase::Connected)?;
            let peer = session.peer_mut();
            peer.alias = alias;
            peer.device = device;
            tracing::info!("Connected to {} at {} ({})", peer.alias, addr, keys.peer_fingerprint());
            shared.emit(ClientEvent::PeerChanged(peer.clone()));
            Ok((keys, stream))
        }
        other => Err(TransferError::Unexpected {
            expected: "waiting for hello",
            got: other.name(),
        }),
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut session: TransferSession,
    keys: Arc<Session>,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
    _claim: SessionClaim,
) -> TransferOutcome {
    let (rd, mut wr) = stream.into_split();
    let (tx, mut inbound) = mpsc::channel(16);
    let reader = tokio::spawn(read_loop(keys.clone(), rd, tx));

    let mut io = Io {
        keys: keys.as_ref(),
        wr: &mut wr,
        inbound: &mut inbound,
        commands: &mut commands,
        token: &token,
    };
    let result = run(&shared, &mut session, &mut io).await;
    reader.abort();

    let outcome = result.unwrap_or_else(|e| {
        session.fail(e.to_string());
        TransferOutcome::Failed {
            reason: e.to_string(),
        }
    });
    shared.emit(ClientEvent::SessionEnded {
        peer: session.peer().clone(),
        outcome: outcome.clone(),
    });
    outcome
}

/// Frames off the wire. After an `archive` header exactly `len` bytes of raw
/// chunk frames follow before the next message.
async fn read_loop(keys: Arc<Session>, mut rd: OwnedReadHalf, tx: mpsc::Sender<Inbound>) {
    loop {
        let frame = match keys.read_frame(&mut rd).await {
            Ok(frame) => frame,
            Err(e) => {
                let _ = tx.send(Inbound::Closed(e.to_string())).await;
                return;
            }
        };
        let msg: Message = match serde_json::from_slice(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Ignoring malformed message: {}", e);
                continue;
            }
        };

        let mut remaining = match &msg {
            Message::Archive { len, .. } => *len,
            _ => 0,
        };
        if tx.send(Inbound::Message(msg)).await.is_err() {
            return;
        }
        while remaining > 0 {
            let item = match keys.read_frame(&mut rd).await {
                Ok(chunk) if chunk.len() as u64 <= remaining => {
                    remaining -= chunk.len() as u64;
                    Inbound::Chunk(chunk)
                }
                Ok(_) => Inbound::Closed("archive data overruns announced length".to_string()),
                Err(e) => Inbound::Closed(e.to_string()),
            };
            let stop = matches!(item, Inbound::Closed(_));
            if tx.send(item).await.is_err() || stop {
                return;
            }
        }
    }
}

struct Io<'a> {
    keys: &'a Session,
    wr: &'a mut OwnedWriteHalf,
    inbound: &'a mut mpsc::Receiver<Inbound>,
    commands: &'a mut mpsc::UnboundedReceiver<Command>,
    token: &'a CancellationToken,
}

fn aborted(reason: String) -> TransferError {
    std::io::Error::new(std::io::ErrorKind::ConnectionAborted, reason).into()
}

async fn run(shared: &Shared, session: &mut TransferSession, io: &mut Io<'_>) -> Result<TransferOutcome, TransferError> {
    let mut accepted: Option<Request> = None;

    loop {
        tokio::select! {
            _ = io.token.cancelled() => return Err(TransferError::Cancelled),
            cmd = io.commands.recv() => match cmd {
                None | Some(Command::Cancel) => return Err(TransferError::Cancelled),
                Some(Command::Accept(id)) => {
                    if accepted.is_some() {
                        tracing::warn!("A transfer is already requested; ignoring accept of {}", id);
                        continue;
                    }
                    let Some(request) = session.peer_mut().dismiss_request(&id) else {
                        tracing::warn!("{}", TransferError::UnknownRequest(id));
                        continue;
                    };
                    let project_id = request.context.target_translation_id.clone();
                    Message::RequestTranslation {
                        request_id: request.id.clone(),
                        target_translation_id: project_id.clone(),
                    }
                    .send(io.keys, &mut *io.wr)
                    .await?;
                    session.set_project(project_id);
                    session.peer_mut().status.set_waiting(true);
                    shared.emit(ClientEvent::PeerChanged(session.peer().clone()));
                    accepted = Some(request);
                }
                Some(Command::Decline(id)) => {
                    if session.peer_mut().dismiss_request(&id).is_none() {
                        tracing::warn!("{}", TransferError::UnknownRequest(id));
                        continue;
                    }
                    Message::Decline { request_id: id }.send(io.keys, &mut *io.wr).await?;
                    shared.emit(ClientEvent::PeerChanged(session.peer().clone()));
                }
            },
            item = io.inbound.recv() => match item {
                None => return Err(TransferError::Closed),
                Some(Inbound::Closed(reason)) => return Err(aborted(reason)),
                Some(Inbound::Chunk(_)) => {
                    return Err(TransferError::Unexpected {
                        expected: "no archive is being received",
                        got: "archive data",
                    })
                }
                Some(Inbound::Message(msg)) => match msg {
                    Message::Request(request) => on_request(shared, session, io, request).await?,
                    Message::Archive { request_id, len, sha256 } => {
                        let Some(request) = accepted.as_ref().filter(|r| r.id == request_id) else {
                            return Err(TransferError::Unexpected {
                                expected: "no transfer was requested",
                                got: "archive",
                            });
                        };
                        session.advance(Phase::Transferring)?;
                        let outcome = receive(shared, session, io, request, len, &sha256).await?;
                        session.advance(Phase::Completed)?;
                        let _ = Message::Bye.send(io.keys, &mut *io.wr).await;
                        return Ok(outcome);
                    }
                    Message::Unavailable { request_id, reason } => {
                        return Err(TransferError::archive(anyhow::anyhow!(
                            "peer could not send {request_id}: {reason}"
                        )));
                    }
                    Message::Bye if accepted.is_some() => return Err(TransferError::Closed),
                    Message::Bye => {
                        session.advance(Phase::Completed)?;
                        return Ok(TransferOutcome::Declined);
                    }
                    other => tracing::debug!("Ignoring {} from {}", other.name(), session.peer().alias),
                },
            },
        }
    }
}

async fn on_request(
    shared: &Shared,
    session: &mut TransferSession,
    io: &mut Io<'_>,
    request: Request,
) -> Result<(), TransferError> {
    let version = request.context.package_version;
    if !is_supported(version, shared.cfg.max_package_version) {
        tracing::warn!(
            "Declining {} from {}: {}",
            request.context.target_translation_id,
            session.peer().alias,
            TransferError::UnsupportedVersion {
                found: version,
                max: shared.cfg.max_package_version,
            }
        );
        Message::Decline {
            request_id: request.id.clone(),
        }
        .send(io.keys, &mut *io.wr)
        .await?;
        shared.emit(ClientEvent::UnsupportedVersion {
            peer: session.peer().clone(),
            request,
        });
        return Ok(());
    }

    tracing::info!(
        "{} offers {} ({})",
        session.peer().alias,
        request.context.project_name,
        request.context.target_language_name
    );
    session.peer_mut().push_request(request.clone());
    shared.emit(ClientEvent::RequestReceived {
        peer: session.peer().clone(),
        request,
    });
    Ok(())
}

async fn receive(
    shared: &Shared,
    session: &mut TransferSession,
    io: &mut Io<'_>,
    request: &Request,
    len: u64,
    sha256: &str,
) -> Result<TransferOutcome, TransferError> {
    let mut staged = shared
        .store
        .stage(session.id())
        .await
        .map_err(TransferError::archive)?;

    while staged.written() < len {
        let chunk = tokio::select! {
            _ = io.token.cancelled() => return Err(TransferError::Cancelled),
            cmd = io.commands.recv() => match cmd {
                None | Some(Command::Cancel) => return Err(TransferError::Cancelled),
                Some(other) => {
                    tracing::debug!("Ignoring {:?} during transfer", other);
                    continue;
                }
            },
            item = io.inbound.recv() => match item {
                Some(Inbound::Chunk(chunk)) => chunk,
                Some(Inbound::Closed(reason)) => return Err(aborted(reason)),
                Some(Inbound::Message(msg)) => {
                    return Err(TransferError::Unexpected {
                        expected: "receiving archive data",
                        got: msg.name(),
                    })
                }
                None => return Err(TransferError::Closed),
            },
        };
        staged.write_chunk(&chunk).await.map_err(TransferError::archive)?;

        let received = staged.written();
        if session.peer_mut().status.set_progress(percent(received, len)) {
            shared.emit(ClientEvent::Progress {
                peer: session.peer().clone(),
                received,
                total: len,
            });
        }
    }
    let archive = staged.commit(len, sha256).await.map_err(TransferError::archive)?;

    let project_id = request.context.target_translation_id.clone();
    let (report, verdict) = {
        let _guard = shared.locks.lock(&project_id).await;
        let report = shared
            .importer
            .import(&archive, &project_id)
            .await
            .map_err(TransferError::archive)?;
        let verdict = if report.merged {
            let project = ProjectRef::new(&report.project_id, &report.path);
            Some(shared.classifier.classify(&project).await?)
        } else {
            None
        };
        (report, verdict)
    };
    // committed archives are named by lowercase hex whatever case the peer used
    let archive_id = sha256.to_ascii_lowercase();
    if let Err(e) = shared.store.remove(&archive_id).await {
        tracing::warn!("Could not remove stored archive {}: {:#}", archive_id, e);
    }

    session.peer_mut().status.set_waiting(false);
    tracing::info!(
        "Imported {} from {} ({})",
        project_id,
        session.peer().alias,
        if report.merged { "merged" } else { "new" }
    );
    shared.emit(ClientEvent::Completed {
        peer: session.peer().clone(),
        report: report.clone(),
        verdict: verdict.clone(),
    });
    Ok(TransferOutcome::Imported {
        project_id,
        merged: report.merged,
        verdict,
    })
}
