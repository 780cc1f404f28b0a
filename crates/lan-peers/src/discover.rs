use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::{Announcement, Peer, MAX_DATAGRAM};
use crate::roster::{Roster, Upsert};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Found(Peer),
    Changed(Peer),
    Lost(Peer),
}

/// Listens for discovery datagrams and keeps the roster current.
pub struct Listener {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
    snapshot: watch::Receiver<Vec<Peer>>,
}

impl Listener {
    pub async fn start(
        cfg: &DiscoveryConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let socket = bind_reusable(cfg.broadcast_port)?;
        let local_addr = socket.local_addr()?;
        tracing::info!("Listening for announcements on {}", local_addr);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(Vec::new());
        let token = CancellationToken::new();

        let worker = Worker {
            roster: Roster::new(cfg.ttl),
            instance: cfg.instance.clone(),
            events: events_tx,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(worker.run(socket, cfg.sweep_interval, token.clone()));

        Ok((
            Self {
                token,
                task: Some(task),
                local_addr,
                snapshot,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current roster snapshot.
    pub fn peers(&self) -> Vec<Peer> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Peer>> {
        self.snapshot.clone()
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Listen for `timeout` and return whoever was heard.
pub async fn browse(cfg: &DiscoveryConfig, timeout: Duration) -> Result<Vec<Peer>, DiscoveryError> {
    let (listener, mut events) = Listener::start(cfg).await?;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            ev = events.recv() => match ev {
                Some(DiscoveryEvent::Found(p)) => tracing::info!("Found {} at {}", p.alias, p.address),
                Some(_) => {}
                None => break,
            },
        }
    }

    let peers = listener.peers();
    listener.stop().await;
    Ok(peers)
}

struct Worker {
    roster: Roster,
    instance: String,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    snapshot: watch::Sender<Vec<Peer>>,
}

impl Worker {
    async fn run(mut self, socket: UdpSocket, sweep_every: Duration, token: CancellationToken) {
        let mut sweep = tokio::time::interval(sweep_every);
        // one spare byte so an oversized datagram shows up as such
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sweep.tick() => self.sweep(Instant::now()),
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, src)) => {
                        if let Some(ev) = self.handle_datagram(&buf[..n], src.ip(), Instant::now()) {
                            self.publish(ev);
                        }
                    }
                    Err(e) => tracing::warn!("Discovery receive failed: {}", e),
                },
            }
        }
        tracing::debug!("Listener stopped");
    }

    /// Apply one datagram to the roster. Returns the event to publish, if any.
    fn handle_datagram(&mut self, bytes: &[u8], source: IpAddr, now: Instant) -> Option<DiscoveryEvent> {
        if bytes.len() > MAX_DATAGRAM {
            tracing::debug!("Dropping oversized datagram from {} ({} bytes)", source, bytes.len());
            return None;
        }
        let ann = match Announcement::decode(bytes) {
            Ok(ann) => ann,
            Err(e) => {
                tracing::debug!("Dropping datagram from {}: {}", source, e);
                return None;
            }
        };
        if ann.instance == self.instance {
            return None;
        }

        let peer = ann.into_peer(source);
        let addr = peer.address;
        let kind = self.roster.upsert(peer, now);
        let current = self.roster.find(&addr)?.clone();
        match kind {
            Upsert::New => Some(DiscoveryEvent::Found(current)),
            Upsert::Changed => Some(DiscoveryEvent::Changed(current)),
            Upsert::Refreshed => None,
        }
    }

    fn sweep(&mut self, now: Instant) {
        for peer in self.roster.expire(now) {
            tracing::info!("Lost {} at {}", peer.alias, peer.address);
            self.publish(DiscoveryEvent::Lost(peer));
        }
    }

    fn publish(&self, ev: DiscoveryEvent) {
        // snapshot first so a consumer reacting to the event sees it
        self.snapshot.send_replace(self.roster.all());
        let _ = self.events.send(ev);
    }
}

fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&SockAddr::from(addr))?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::Announcer;
    use crate::model::DeviceClass;

    fn worker(instance: &str, ttl: Duration) -> (Worker, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(Vec::new());
        let w = Worker {
            roster: Roster::new(ttl),
            instance: instance.to_string(),
            events,
            snapshot,
        };
        (w, rx)
    }

    fn datagram(instance: &str, alias: &str, port: u16) -> Vec<u8> {
        Announcement::new(instance, alias, DeviceClass::Tablet, port).encode().unwrap()
    }

    #[test]
    fn own_and_malformed_datagrams_are_ignored() {
        let (mut w, _rx) = worker("me", Duration::from_secs(4));
        let src: IpAddr = "192.168.1.9".parse().unwrap();
        let now = Instant::now();

        assert!(w.handle_datagram(&datagram("me", "self", 9939), src, now).is_none());
        assert!(w.handle_datagram(b"{garbage", src, now).is_none());

        let mut padded = datagram("other", "Joel-Tablet", 9939);
        padded.resize(MAX_DATAGRAM + 1, b' ');
        assert!(w.handle_datagram(&padded, src, now).is_none());
        assert!(w.roster.is_empty());
    }

    #[test]
    fn found_changed_then_lost() {
        let ttl = Duration::from_secs(4);
        let (mut w, mut rx) = worker("me", ttl);
        let src: IpAddr = "192.168.1.9".parse().unwrap();
        let t0 = Instant::now();

        let ev = w.handle_datagram(&datagram("other", "Joel-Tablet", 9939), src, t0);
        assert!(matches!(ev, Some(DiscoveryEvent::Found(ref p)) if p.address.port() == 9939));
        assert!(w.handle_datagram(&datagram("other", "Joel-Tablet", 9939), src, t0).is_none());
        let ev = w.handle_datagram(&datagram("other", "Joel", 9939), src, t0);
        assert!(matches!(ev, Some(DiscoveryEvent::Changed(ref p)) if p.alias == "Joel"));

        w.sweep(t0 + ttl + Duration::from_millis(1));
        assert!(matches!(rx.try_recv(), Ok(DiscoveryEvent::Lost(ref p)) if p.alias == "Joel"));
        assert!(w.roster.is_empty());
    }

    #[tokio::test]
    async fn announced_tablet_shows_up_within_two_intervals() -> anyhow::Result<()> {
        let listen_cfg = DiscoveryConfig {
            broadcast_port: 0,
            ..DiscoveryConfig::default()
        };
        let (listener, mut events) = Listener::start(&listen_cfg).await?;
        let port = listener.local_addr().port();

        let announce_cfg = DiscoveryConfig {
            service_port: 9939,
            broadcast_port: port,
            interval: Duration::from_millis(2000),
            targets: Some(vec![SocketAddr::from(([127, 0, 0, 1], port))]),
            ..DiscoveryConfig::default()
        }
        .with_identity("Joel-Tablet", DeviceClass::Tablet);
        let announcer = Announcer::start(&announce_cfg).await?;

        let ev = tokio::time::timeout(Duration::from_millis(4000), events.recv()).await?;
        match ev {
            Some(DiscoveryEvent::Found(peer)) => {
                assert_eq!(peer.alias, "Joel-Tablet");
                assert_eq!(peer.address.port(), 9939);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        let peers = listener.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].alias, "Joel-Tablet");

        announcer.stop().await;
        listener.stop().await;
        Ok(())
    }
}
