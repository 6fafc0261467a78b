//! Hoard Daemon - A node of the Hoard peer-to-peer file store.
//!
//! Provides:
//! - A long-running node that accepts, replicates and serves files
//! - One-shot `put` and `get` against an existing network
//! - Helpers to generate a network secret and locate a key on disk

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::select;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hoard_core::{hash_key, SecretKey};
use hoard_net::{TcpTransport, TcpTransportConfig};
use hoard_server::{FileServer, FileServerConfig};
use hoard_store::{cas_path_transform, StoreConfig};

/// Hoard daemon.
#[derive(Parser)]
#[command(name = "hoardd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log more (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the TOML config
    #[arg(short, long, default_value = "~/.hoard/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Extra bootstrap node, may be repeated
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },

    /// Store a file on the network
    Put {
        /// Key to store under
        key: String,
        /// File to read
        file: PathBuf,
    },

    /// Fetch a file from the network
    Get {
        /// Key to fetch
        key: String,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print where a key is stored on disk
    Path {
        /// Application key
        key: String,
    },

    /// Print a fresh network secret
    Keygen,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Listen address
    listen_addr: SocketAddr,
    /// Bootstrap nodes
    bootstrap_nodes: Vec<String>,
    /// Network secret
    secret: SecretKey,
    /// False if the secret was generated rather than configured
    secret_configured: bool,
    /// Store root
    data_dir: PathBuf,
    /// How long a fetch waits for peers
    response_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            bootstrap_nodes: Vec::new(),
            secret: SecretKey::random(),
            secret_configured: false,
            data_dir: PathBuf::from("~/.hoard/data"),
            response_timeout: FileServerConfig::DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Reads the daemon config, falling back to defaults if the file is absent.
fn load_config(path: &Path) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!(path = ?path, "Config file absent, using defaults");
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<DaemonConfig> {
    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DaemonConfig::default();

    // [network]: listen, bootstrap, secret, response_timeout_secs
    if let Some(network) = toml.get("network") {
        if let Some(listen) = network.get("listen").and_then(|v| v.as_str()) {
            config.listen_addr = listen.parse().context("Invalid listen address")?;
        }
        if let Some(bootstrap) = network.get("bootstrap").and_then(|v| v.as_array()) {
            config.bootstrap_nodes = bootstrap
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        if let Some(secret) = network.get("secret").and_then(|v| v.as_str()) {
            config.secret = SecretKey::from_hex(secret).context("Invalid network secret")?;
            config.secret_configured = true;
        }
        if let Some(secs) = network.get("response_timeout_secs").and_then(|v| v.as_integer()) {
            config.response_timeout = Duration::from_secs(secs.max(0) as u64);
        }
    }

    // [storage]: root
    if let Some(storage) = toml.get("storage") {
        if let Some(root) = storage.get("root").and_then(|v| v.as_str()) {
            config.data_dir = PathBuf::from(root);
        }
    }

    Ok(config)
}

/// Resolves a leading `~/` against the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Builds a file server from the configuration.
fn build_server(config: &DaemonConfig) -> FileServer {
    let transport = TcpTransport::new(TcpTransportConfig::new(config.listen_addr));
    let server_config = FileServerConfig::new(
        config.secret.clone(),
        StoreConfig::new(expand_tilde(&config.data_dir)),
    )
    .with_bootstrap_nodes(config.bootstrap_nodes.clone())
    .with_response_timeout(config.response_timeout);

    FileServer::new(server_config, Arc::new(transport))
}

/// Waits until the server has at least one peer or `timeout` elapses.
async fn wait_for_peers(server: &FileServer, timeout: Duration) -> usize {
    let start = Instant::now();
    while server.peer_count() == 0 && start.elapsed() < timeout {
        sleep(Duration::from_millis(50)).await;
    }
    server.peer_count()
}

/// `put` and `get` exchange data with existing nodes, which only works
/// with the network's shared secret.
fn require_secret(config: &DaemonConfig) -> Result<()> {
    if !config.secret_configured {
        bail!("No network secret configured; set [network] secret to the secret shared by the other nodes (see `hoardd keygen`)");
    }
    Ok(())
}

/// Starts a short-lived node on an ephemeral port for `put` and `get`.
async fn start_client(mut config: DaemonConfig) -> Result<FileServer> {
    if config.bootstrap_nodes.is_empty() {
        warn!("No bootstrap nodes configured, only the local store is used");
    }
    config.listen_addr.set_port(0);

    let server = build_server(&config);
    server.start().await.context("Failed to start node")?;

    let peers = wait_for_peers(&server, Duration::from_secs(5)).await;
    debug!(peers, "Client node ready");
    Ok(server)
}

async fn run(config: DaemonConfig) -> Result<()> {
    if !config.secret_configured {
        warn!("No network secret configured; generated a random one, other nodes will not be able to read our files");
    }

    info!("Starting Hoard daemon");
    info!(listen = %config.listen_addr, bootstrap = config.bootstrap_nodes.len(), "Node configured");
    debug!(data_dir = ?expand_tilde(&config.data_dir), "Store root");

    let server = build_server(&config);
    let addr = server.start().await.context("Failed to start file server")?;

    // Ctrl+C ends the run loop
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                error!(error = %e, "Cannot install Ctrl+C handler");
            }
        }
    });

    println!("Hoard daemon running");
    println!("  Listen: {}", addr);
    println!("  Data: {:?}", server.local_store().root());
    println!();
    println!("Stop with Ctrl+C");

    let mut status_interval = interval(Duration::from_secs(60));
    loop {
        select! {
            _ = status_interval.tick() => {
                debug!(peers = server.peer_count(), "Status");
            }

            _ = shutdown_rx.recv() => {
                info!("Shutting down");
                break;
            }
        }
    }

    server.stop().await;
    info!("Daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -v count picks the log level
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Cannot install log subscriber")?;

    // CLI flags are applied on top of the file
    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run {
        listen: None,
        bootstrap: Vec::new(),
    }) {
        Commands::Run { listen, bootstrap } => {
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }
            config.bootstrap_nodes.extend(bootstrap);
            run(config).await?;
        }

        Commands::Put { key, file } => {
            require_secret(&config)?;
            let mut reader = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {:?}", file))?;

            let server = start_client(config).await?;
            let peers = server.peer_count();
            let size = server.store(&key, &mut reader).await.context("Failed to store file")?;
            server.stop().await;

            println!("Stored {} ({} bytes) on {} peer(s)", key, size, peers);
        }

        Commands::Get { key, output } => {
            require_secret(&config)?;
            let server = start_client(config).await?;
            let (size, mut file) = server.get(&key).await.context("Failed to fetch file")?;

            match output {
                Some(path) => {
                    let mut out = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Failed to create {:?}", path))?;
                    tokio::io::copy(&mut file, &mut out).await?;
                    eprintln!("Wrote {} bytes to {:?}", size, path);
                }
                None => {
                    tokio::io::copy(&mut file, &mut tokio::io::stdout()).await?;
                }
            }
            server.stop().await;
        }

        Commands::Path { key } => {
            let network_key = hash_key(&key);
            let path_key = cas_path_transform(&network_key);
            println!("Network key: {}", network_key);
            println!("Path: {}", path_key.file_under(&expand_tilde(&config.data_dir)).display());
        }

        Commands::Keygen => {
            println!("{}", SecretKey::random().to_hex());
        }
    }

    Ok(())
}
