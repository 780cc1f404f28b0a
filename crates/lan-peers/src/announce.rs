use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::model::Announcement;
use crate::net;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle so the device keeps being announced while this is alive.
pub struct Announcer {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    instance: String,
}

impl Announcer {
    pub async fn start(cfg: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        let targets = cfg
            .targets
            .clone()
            .unwrap_or_else(|| net::broadcast_targets(cfg.broadcast_port));
        let payload =
            Announcement::new(&cfg.instance, &cfg.alias, cfg.device, cfg.service_port).encode()?;

        tracing::info!(
            "Announcing {} (tcp {}) every {:?} to {} target(s)",
            cfg.alias,
            cfg.service_port,
            cfg.interval,
            targets.len()
        );

        let token = CancellationToken::new();
        let task = tokio::spawn(run(socket, payload, targets, cfg.interval, token.clone()));

        Ok(Self {
            token,
            task: Some(task),
            instance: cfg.instance.clone(),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Stop announcing and wait for the socket to close.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    socket: UdpSocket,
    payload: Vec<u8>,
    targets: Vec<SocketAddr>,
    every: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for target in &targets {
                    // a lost datagram is retried on the next tick
                    if let Err(e) = socket.send_to(&payload, target).await {
                        tracing::debug!("Announcement to {} failed: {}", target, e);
                    }
                }
            }
        }
    }
    tracing::debug!("Announcer stopped");
}
