use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use git_sync::{
    ClassifierConfig, CloneStatus, ConflictCheck, FileSshKeys, GitBackend, MergeConflictClassifier,
    ProjectLocks, ProjectRef, RejectionChoice, RemoteConfig, SshKeyProvider, SyncOrchestrator,
};
use lan_peers::{Announcer, DeviceClass, DiscoveryConfig, Peer};
use storage::LocalArchiveStore;
use tsync_core::{
    ClientEvent, DeviceIdentity, ProjectExporter, ServerEvent, SessionRegistry, TarProjects,
    TransferClient, TransferConfig, TransferOutcome, TransferServer,
};

#[derive(Parser, Debug)]
#[command(name = "tsync", version, about = "Translation project transfer and backup sync")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory (identity, config, projects)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the device identity and configuration
    Init {
        /// Name shown to other devices
        #[arg(long)]
        alias: String,

        /// phone, tablet or other
        #[arg(long, default_value_t = DeviceClass::Other)]
        device: DeviceClass,
    },

    /// Show device information
    Info,

    /// Announce this device on the local network
    Announce {
        /// Advertised transfer port (defaults to the configured listen port)
        #[arg(long)]
        port: Option<u16>,

        /// Seconds to keep announcing (0 = until Ctrl+C)
        #[arg(long, default_value_t = 0)]
        ttl: u64,
    },

    /// Discover devices on the local network
    Discover {
        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Offer a project to nearby devices
    Serve {
        /// Project id under the projects directory
        #[arg(long)]
        project: String,
    },

    /// Connect to a device and receive the project it offers
    Receive {
        /// Peer address (host:port); discovered when omitted
        #[arg(long)]
        peer: Option<SocketAddr>,

        /// Discovery timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,

        /// Accept offers without asking
        #[arg(long)]
        yes: bool,
    },

    /// Pull then push a project against its remote backup
    Sync {
        #[arg(long)]
        project: String,
    },

    /// Answer a rejected push
    Resolve {
        #[arg(long)]
        project: String,

        #[arg(long, value_enum)]
        choice: Resolution,
    },

    /// Report whether a project has unresolved merge conflicts
    CheckConflicts {
        #[arg(long)]
        project: String,
    },

    /// Clone a project from the remote backup
    Clone {
        #[arg(long)]
        project: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Resolution {
    Merge,
    AcceptRemote,
}

impl From<Resolution> for RejectionChoice {
    fn from(r: Resolution) -> Self {
        match r {
            Resolution::Merge => RejectionChoice::Merge,
            Resolution::AcceptRemote => RejectionChoice::AcceptRemote,
        }
    }
}

/// Everything persisted in `<data_dir>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    discovery: DiscoveryConfig,
    transfer: TransferConfig,
    remote: RemoteConfig,
    classifier: ClassifierConfig,
}

impl CliConfig {
    fn new(data_dir: &Path, alias: &str, device: DeviceClass) -> Self {
        let mut cfg = CliConfig::default();
        cfg.discovery = cfg.discovery.with_identity(alias, device);
        cfg.transfer = cfg.transfer.with_data_dir(data_dir.to_path_buf());
        cfg.transfer.alias = alias.to_string();
        cfg.transfer.device = device;
        cfg.discovery.service_port = cfg.transfer.listen_port;
        cfg
    }

    fn load(data_dir: &Path) -> Result<Self> {
        let cfg_path = data_dir.join("config.json");
        if !cfg_path.exists() {
            anyhow::bail!("Device not initialized. Run 'tsync init' first.");
        }
        let cfg_json = std::fs::read_to_string(&cfg_path)
            .with_context(|| format!("reading {}", cfg_path.display()))?;
        let mut cfg: CliConfig = serde_json::from_str(&cfg_json).context("parsing config.json")?;
        cfg.transfer.data_dir = data_dir.to_path_buf();
        Ok(cfg)
    }

    fn save(&self, data_dir: &Path) -> Result<()> {
        let cfg_json = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join("config.json"), cfg_json)?;
        Ok(())
    }

    /// A relative local remote root lives inside the data directory.
    fn remote(&self) -> RemoteConfig {
        match &self.remote {
            RemoteConfig::Local { root } if root.is_relative() => RemoteConfig::Local {
                root: self.transfer.data_dir.join(root),
            },
            other => other.clone(),
        }
    }

    fn project(&self, project_id: &str) -> Result<ProjectRef> {
        let projects = TarProjects::new(self.transfer.projects_dir(), self.classifier.clone());
        Ok(ProjectRef::new(project_id, projects.project_path(project_id)?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tsync")
    });

    match cli.cmd {
        Commands::Init { alias, device } => {
            let cfg = CliConfig::new(&data_dir, &alias, device);
            cfg.transfer.ensure_data_dir()?;
            let identity = DeviceIdentity::load_or_generate(&cfg.transfer.identity_path())?;
            cfg.save(&data_dir)?;

            println!("✓ Device initialized");
            println!("  Alias: {} ({})", alias, device);
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
        }

        Commands::Info => {
            let cfg = CliConfig::load(&data_dir)?;
            let identity = load_identity(&cfg)?;

            println!("Device Information:");
            println!("  Alias: {} ({})", cfg.transfer.alias, cfg.transfer.device);
            println!("  Fingerprint: {}", identity.fingerprint());
            println!("  Data directory: {}", data_dir.display());
            println!("  Listen port: {}", cfg.transfer.listen_port);
            println!("  Broadcast port: {}", cfg.discovery.broadcast_port);
            println!("  Package version: {}", cfg.transfer.max_package_version);
            match cfg.remote() {
                RemoteConfig::Gogs { api_url, user, .. } => println!("  Remote: {} as {}", api_url, user),
                RemoteConfig::Local { root } => println!("  Remote: {}", root.display()),
            }
        }

        Commands::Announce { port, ttl } => {
            let cfg = CliConfig::load(&data_dir)?;
            let mut discovery = cfg.discovery.clone();
            discovery.service_port = port.unwrap_or(cfg.transfer.listen_port);
            announce(&discovery, ttl).await?;
        }

        Commands::Discover { timeout, json } => {
            let cfg = CliConfig::load(&data_dir)?;
            discover(&cfg.discovery, timeout, json).await?;
        }

        Commands::Serve { project } => {
            let cfg = CliConfig::load(&data_dir)?;
            serve(&cfg, &project).await?;
        }

        Commands::Receive { peer, timeout, yes } => {
            let cfg = CliConfig::load(&data_dir)?;
            receive(&cfg, peer, timeout, yes).await?;
        }

        Commands::Sync { project } => {
            let cfg = CliConfig::load(&data_dir)?;
            let outcome = orchestrator(&cfg).sync(&cfg.project(&project)?).await?;
            tracing::info!("Sync of {} finished: {:?}", project, outcome);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Resolve { project, choice } => {
            let cfg = CliConfig::load(&data_dir)?;
            let outcome = orchestrator(&cfg)
                .resolve_rejection(&cfg.project(&project)?, choice.into())
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::CheckConflicts { project } => {
            let cfg = CliConfig::load(&data_dir)?;
            let classifier = MergeConflictClassifier::new(cfg.classifier.clone());
            let verdict = classifier.classify(&cfg.project(&project)?).await?;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }

        Commands::Clone { project } => {
            let cfg = CliConfig::load(&data_dir)?;
            let dest = cfg.project(&project)?.path;
            let outcome = orchestrator(&cfg).clone_project(&project, &dest).await?;
            match outcome.status {
                CloneStatus::Cloned => println!("✓ Cloned {} into {}", project, dest.display()),
                status => {
                    anyhow::bail!(
                        "clone of {} failed ({:?}): {}",
                        project,
                        status,
                        outcome.detail.unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

fn load_identity(cfg: &CliConfig) -> Result<DeviceIdentity> {
    DeviceIdentity::load(&cfg.transfer.identity_path())
        .context("Device not initialized. Run 'tsync init' first.")
}

fn orchestrator(cfg: &CliConfig) -> SyncOrchestrator {
    let keys: Arc<dyn SshKeyProvider> = Arc::new(FileSshKeys::new(
        cfg.transfer.data_dir.join("ssh"),
        cfg.transfer.alias.clone(),
    ));
    let backend = Arc::new(GitBackend::new(keys.clone(), cfg.classifier.clone()));
    SyncOrchestrator::new(
        backend,
        cfg.remote().host(&cfg.transfer.alias),
        keys,
        Arc::new(MergeConflictClassifier::new(cfg.classifier.clone())),
        ProjectLocks::new(),
    )
}

async fn announce(discovery: &DiscoveryConfig, ttl: u64) -> Result<()> {
    let announcer = Announcer::start(discovery).await?;
    println!(
        "✓ Announcing {} (tcp {}) on UDP {}",
        discovery.alias, discovery.service_port, discovery.broadcast_port
    );

    if ttl == 0 {
        println!("  Press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
    } else {
        tokio::time::sleep(Duration::from_secs(ttl)).await;
    }

    announcer.stop().await;
    Ok(())
}

async fn discover(discovery: &DiscoveryConfig, timeout: u64, json: bool) -> Result<()> {
    let peers = lan_peers::discover::browse(discovery, Duration::from_secs(timeout)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&peers)?);
    } else {
        println!("Discovered {} device(s):", peers.len());
        for peer in peers {
            println!("  {} ({}) @ {}", peer.alias, peer.device, peer.address);
        }
    }
    Ok(())
}

async fn serve(cfg: &CliConfig, project: &str) -> Result<()> {
    let identity = Arc::new(load_identity(cfg)?);
    let projects = Arc::new(TarProjects::new(cfg.transfer.projects_dir(), cfg.classifier.clone()));
    let context = projects.describe(project).await?;

    let (server, mut events) = TransferServer::start(
        &cfg.transfer,
        identity,
        projects,
        project,
        SessionRegistry::new(),
    )
    .await?;

    let mut discovery = cfg.discovery.clone();
    discovery.service_port = server.local_addr().port();
    let announcer = Announcer::start(&discovery).await?;
    tracing::info!("Announcing {} on port {}", announcer.instance(), discovery.service_port);

    println!(
        "✓ Offering {} ({}) on {}",
        context.project_name,
        context.target_language_name,
        server.local_addr()
    );
    println!("  Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            ev = events.recv() => match ev {
                Some(ServerEvent::PeerConnected(peer)) => println!("\n← Connection from {}", peer.address),
                Some(ServerEvent::PeerChanged(_)) => {}
                Some(ServerEvent::RequestDeclined { peer, .. }) => println!("  {} declined", peer.alias),
                Some(ServerEvent::TransferSent { peer, bytes, .. }) => {
                    println!("✓ Sent {} bytes to {}", bytes, peer.alias)
                }
                Some(ServerEvent::SessionEnded { peer, outcome: TransferOutcome::Failed { reason } }) => {
                    tracing::error!("Session with {} failed: {}", peer.alias, reason);
                    println!("✗ Session with {} failed: {}", peer.alias, reason)
                }
                Some(ServerEvent::SessionEnded { .. }) => {}
                None => break,
            },
        }
    }

    announcer.stop().await;
    server.stop().await;
    Ok(())
}

async fn pick_peer(discovery: &DiscoveryConfig, timeout: u64) -> Result<Peer> {
    println!("Looking for devices...");
    let mut peers = lan_peers::discover::browse(discovery, Duration::from_secs(timeout)).await?;
    match peers.len() {
        0 => anyhow::bail!("No devices found"),
        1 => Ok(peers.remove(0)),
        n => {
            for (i, peer) in peers.iter().enumerate() {
                println!("  [{}] {} ({}) @ {}", i + 1, peer.alias, peer.device, peer.address);
            }
            let answer = prompt(&format!("Connect to which device? [1-{}] ", n)).await?;
            let index: usize = answer.parse().context("Invalid selection")?;
            if index == 0 || index > n {
                anyhow::bail!("Invalid selection: {}", index);
            }
            Ok(peers.remove(index - 1))
        }
    }
}

async fn receive(cfg: &CliConfig, address: Option<SocketAddr>, timeout: u64, yes: bool) -> Result<()> {
    let identity = Arc::new(load_identity(cfg)?);
    let peer = match address {
        Some(addr) => Peer::new(addr.to_string(), addr, DeviceClass::Other),
        None => pick_peer(&cfg.discovery, timeout).await?,
    };

    let projects = Arc::new(TarProjects::new(cfg.transfer.projects_dir(), cfg.classifier.clone()));
    let store = Arc::new(LocalArchiveStore::new(cfg.transfer.transfers_dir())?);
    let (client, mut events) = TransferClient::new(
        &cfg.transfer,
        identity,
        store,
        projects,
        Arc::new(MergeConflictClassifier::new(cfg.classifier.clone())),
        ProjectLocks::new(),
        SessionRegistry::new(),
    );

    println!("Connecting to {}...", peer.address);
    let handle = client.connect(peer).await.context("Failed to connect to peer")?;
    println!("✓ Connected to {}", handle.peer().alias);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Cancelling...");
                handle.cancel();
            }
            ev = events.recv() => match ev {
                Some(ClientEvent::RequestReceived { peer, request }) => {
                    let question = format!(
                        "{} offers {} ({}). Accept? [y/N] ",
                        peer.alias, request.context.project_name, request.context.target_language_name
                    );
                    if yes || prompt(&question).await?.eq_ignore_ascii_case("y") {
                        handle.accept(&request.id)?;
                    } else {
                        handle.decline(&request.id)?;
                    }
                }
                Some(ClientEvent::UnsupportedVersion { request, .. }) => {
                    println!(
                        "✗ {} uses package version {}; this device supports up to {}",
                        request.context.project_name,
                        request.context.package_version,
                        cfg.transfer.max_package_version
                    );
                }
                Some(ClientEvent::Progress { received, total, .. }) => {
                    print!("\r  Progress: {}/{} bytes", received, total);
                    std::io::stdout().flush()?;
                }
                Some(ClientEvent::Completed { report, verdict, .. }) => {
                    println!();
                    println!("✓ Received {} into {}", report.project_id, report.path.display());
                    if let Some(verdict) = verdict {
                        println!("{}", serde_json::to_string_pretty(&verdict)?);
                    }
                }
                Some(ClientEvent::SessionEnded { .. }) | None => break,
                Some(ClientEvent::PeerChanged(_)) => {}
            },
        }
    }

    match handle.finished().await {
        TransferOutcome::Failed { reason } => anyhow::bail!("Transfer failed: {}", reason),
        TransferOutcome::Declined => println!("Nothing received"),
        _ => {}
    }
    Ok(())
}

async fn prompt(question: &str) -> Result<String> {
    print!("{}", question);
    std::io::stdout().flush()?;

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut answer = String::new();
    reader.read_line(&mut answer).await?;
    Ok(answer.trim().to_string())
}
