use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use libp2p::identity::Keypair;
use serde::Serialize;
use tokio::fs;
use tracing::{info, warn};

use p2p_file_sync::model::{MetaFile, UserCredentials};
use p2p_file_sync::network::store::{get_document, META_FILE};
use p2p_file_sync::network::{ContentStore, MemoryContentStore, MemoryNetwork};
use p2p_file_sync::process::LoggingListener;
use p2p_file_sync::{Config, SyncNode, VERSION};

/// CLI arguments for the p2p sync node
#[derive(Parser, Debug)]
#[command(
    name = "p2p-sync",
    version = VERSION,
    about = "Peer-to-peer file synchronization between a user's devices",
    long_about = "
Synchronizes files between the devices of one user. Files are split into
verified chunks, described by versioned meta files and downloaded directly
from the user's other online devices.

EXAMPLES:
  In-process round trip over four simulated devices:
    p2p-sync demo --file notes.pdf --peers 4 --chunk-size 65536

  Seed node serving every file in a directory:
    p2p-sync serve --root ./shared --user alice --password secret --pin 1234
"
)]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file on one simulated device and download it on the others
    Demo {
        /// File to synchronize
        #[arg(short = 'f', long = "file", value_name = "FILE_PATH")]
        file: PathBuf,

        /// Number of simulated devices (at least 2)
        #[arg(short = 'p', long = "peers", default_value_t = 3)]
        peers: usize,

        /// Bytes per chunk
        #[arg(short = 'c', long = "chunk-size")]
        chunk_size: Option<u32>,
    },

    /// Run a libp2p node that serves the files of a directory
    Serve {
        /// Directory whose files are uploaded and served
        #[arg(short = 'r', long = "root", value_name = "DIR")]
        root: PathBuf,

        #[arg(long = "user")]
        user: String,

        #[arg(long = "password")]
        password: String,

        #[arg(long = "pin")]
        pin: String,

        /// Multiaddress to listen on
        #[arg(short = 'l', long = "listen", value_name = "LISTEN_ADDR")]
        listen: Option<String>,

        /// TOML configuration file
        #[arg(long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Outcome of one device's download in the demo
#[derive(Debug, Serialize)]
struct DeviceReport {
    peer: String,
    destination: PathBuf,
    verified: bool,
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    file: String,
    file_key: String,
    bytes: u64,
    chunk_size: u32,
    chunks: u32,
    versions: usize,
    devices: Vec<DeviceReport>,
    direct_requests: usize,
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "p2p_file_sync={level},{}={level},libp2p=info",
                    env!("CARGO_CRATE_NAME"),
                    level = level.as_str()
                ))
            }),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level);
    info!("p2p-sync v{}", VERSION);

    match cli.command {
        Commands::Demo {
            file,
            peers,
            chunk_size,
        } => run_demo(&file, peers, chunk_size).await,
        Commands::Serve {
            root,
            user,
            password,
            pin,
            listen,
            config,
        } => {
            let credentials = UserCredentials::new(user, password, pin);
            run_serve(root, credentials, listen, config).await
        }
    }
}

async fn run_demo(file: &Path, peers: usize, chunk_size: Option<u32>) -> Result<()> {
    if peers < 2 {
        bail!("the demo needs at least 2 devices, got {}", peers);
    }
    let source = fs::canonicalize(file)
        .await
        .with_context(|| format!("Cannot access '{}'", file.display()))?;
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Source has no file name")?;

    let mut config = Config::default();
    if let Some(size) = chunk_size {
        config.file.chunk_size = size;
    }
    config.validate().context("Invalid demo configuration")?;

    let work_dir = std::env::temp_dir().join(format!("p2p-sync-demo-{}", uuid::Uuid::new_v4()));
    let result = demo_round_trip(&source, &file_name, peers, config, &work_dir).await;
    if let Err(e) = fs::remove_dir_all(&work_dir).await {
        warn!("Failed to remove demo directory '{}': {}", work_dir.display(), e);
    }

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn demo_round_trip(
    source: &Path,
    file_name: &str,
    peers: usize,
    config: Config,
    work_dir: &Path,
) -> Result<DemoSummary> {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryContentStore::new());
    let credentials = UserCredentials::new("demo", "demo-password", "0000");

    let mut nodes = Vec::with_capacity(peers);
    for device in 0..peers {
        let root = work_dir.join(format!("device-{}", device));
        fs::create_dir_all(&root).await?;
        let mut node = SyncNode::in_memory(&network, store.clone(), config.clone(), root).await?;
        node.add_listener(Arc::new(LoggingListener));
        nodes.push(node);
    }

    nodes[0].register(credentials.clone()).execute().await?;
    for node in &nodes {
        node.login(credentials.clone()).execute().await?;
    }

    let uploaded = nodes[0]
        .upload_as(credentials.clone(), source, file_name)
        .execute()
        .await
        .context("Upload failed")?;
    let entry = uploaded.node.context("Upload produced no file entry")?;
    let original = fs::read(source).await?;

    // every device downloads in turn and then serves the file to the next
    let mut devices = Vec::new();
    for node in &nodes[1..] {
        let destination = node.root().join(file_name);
        let done = node
            .download(credentials.clone(), file_name, None, destination)
            .execute()
            .await
            .with_context(|| format!("Download on {} failed", node.local_peer()))?;
        let copy = fs::read(&done.destination).await?;
        devices.push(DeviceReport {
            peer: node.local_peer().to_string(),
            destination: done.destination,
            verified: copy == original,
        });
    }

    let meta_file: MetaFile = get_document(
        store.as_ref() as &dyn ContentStore,
        entry.file_key.as_str(),
        META_FILE,
        &entry.secret,
    )
    .await?
    .map(|(meta, _)| meta)
    .context("Meta file missing after upload")?;
    let latest = meta_file.latest().context("Meta file has no versions")?;

    Ok(DemoSummary {
        file: file_name.to_string(),
        file_key: entry.file_key.to_string(),
        bytes: latest.total_size,
        chunk_size: latest.chunk_size,
        chunks: latest.chunk_count(),
        versions: meta_file.versions().len(),
        devices,
        direct_requests: network.total_requests().await,
    })
}

async fn run_serve(
    root: PathBuf,
    credentials: UserCredentials,
    listen: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load_from_file(&path)
            .await
            .with_context(|| format!("Failed to load config from '{}'", path.display()))?,
        None => Config::default(),
    };
    if let Some(addr) = listen {
        config.network.listen_addr = addr;
    }
    let root = fs::canonicalize(&root)
        .await
        .with_context(|| format!("Cannot access root '{}'", root.display()))?;

    let store: Arc<dyn ContentStore> = Arc::new(MemoryContentStore::new());
    let (mut node, swarm) = SyncNode::with_swarm(Keypair::generate_ed25519(), store, config, &root)
        .context("Failed to start swarm")?;
    node.add_listener(Arc::new(LoggingListener));

    node.register(credentials.clone()).execute().await?;
    node.login(credentials.clone()).execute().await?;

    let mut entries = fs::read_dir(&root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        match node.upload(credentials.clone(), &path)?.execute().await {
            Ok(uploaded) => {
                if let Some(key) = uploaded.file_key() {
                    info!(file = %uploaded.file_name, file_key = %key, "Serving file");
                }
            }
            Err(e) => warn!("Skipping '{}': {}", path.display(), e),
        }
    }

    // listen addresses show up once the swarm has bound its sockets
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    for addr in swarm.listen_addrs().await? {
        info!("Listening on {}/p2p/{}", addr, node.local_peer());
    }
    info!(files = node.index().len().await, "Node serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
