use anyhow::{Context, Result};
use bridge_control::{Bridge, BridgeChannels, BridgeConfig, MemoryStore, RunList, StoreSeed};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tunnel bridge - control plane for reverse tunnel agents
#[derive(Parser, Debug)]
#[command(name = "tunnel-bridge")]
#[command(about = "Tunnel bridge - authenticates agents and multiplexes their tunnels")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML file with bridge settings
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address agents connect to (e.g., 0.0.0.0:8024)
    #[arg(long, env = "BRIDGE_LISTEN")]
    listen: Option<String>,

    /// Latest protocol only, with timestamp, HMAC and replay checks
    #[arg(long, env = "BRIDGE_SECURE_MODE")]
    secure_mode: bool,

    /// Require user IPs to be registered before links are opened
    #[arg(long, env = "BRIDGE_IP_VERIFY")]
    ip_verify: bool,

    /// UDP rendezvous address handed to agents for P2P
    #[arg(long, env = "BRIDGE_P2P_ADDR")]
    p2p_addr: Option<String>,

    /// YAML file with clients, hosts and tasks to preload
    #[arg(long, env = "BRIDGE_STORE")]
    store: Option<PathBuf>,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_yaml::from_str::<BridgeConfig>(&raw)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => BridgeConfig::default(),
    };

    if let Some(listen) = &cli.listen {
        config = config.with_listen_addr(listen.clone());
    }
    if cli.secure_mode {
        config = config.with_secure_mode(true);
    }
    if cli.ip_verify {
        config = config.with_ip_verify(true);
    }
    if let Some(addr) = &cli.p2p_addr {
        config = config.with_p2p_addr(addr.clone());
    }
    Ok(config)
}

fn load_store(path: Option<&Path>) -> Result<MemoryStore> {
    let Some(path) = path else {
        warn!("No store file given, starting with an empty store");
        return Ok(MemoryStore::new());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read store {}", path.display()))?;
    let seed = StoreSeed::from_yaml(&raw)
        .with_context(|| format!("Failed to parse store {}", path.display()))?;
    info!(
        "Loaded {} clients, {} hosts, {} tasks from {}",
        seed.clients.len(),
        seed.hosts.len(),
        seed.tasks.len(),
        path.display()
    );
    Ok(MemoryStore::from_seed(seed))
}

/// Consume the bridge's outbound queues.
///
/// There is no proxy layer in this binary: created tasks are only marked as
/// running, and secret connections are closed.
fn spawn_queue_consumers(channels: BridgeChannels, run_list: RunList) {
    let BridgeChannels {
        mut open_task,
        mut close_client,
        mut secret,
    } = channels;

    tokio::spawn(async move {
        while let Some(task) = open_task.recv().await {
            info!(
                "Task {} ({}) for client {} on port {}",
                task.id, task.mode, task.client_id, task.port
            );
            run_list.insert(task.id);
        }
    });

    tokio::spawn(async move {
        while let Some(client_id) = close_client.recv().await {
            info!("Client {} closed", client_id);
        }
    });

    tokio::spawn(async move {
        while let Some(request) = secret.recv().await {
            debug!("Secret connection from {} dropped, no secret-tunnel service", request.peer);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!(
        "Tunnel bridge {} (commit {}, built {})",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let config = load_config(&cli)?;
    let store = load_store(cli.store.as_deref())?;

    info!("Listen address: {}", config.listen_addr);
    if config.secure_mode {
        info!("Secure mode enabled");
    }
    if config.ip_verify {
        info!("IP registration required for links");
    }

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let (bridge, channels) = Bridge::new(config, Arc::new(store));
    spawn_queue_consumers(channels, bridge.run_list().clone());

    let shutdown = CancellationToken::new();
    let liveness = bridge.spawn_liveness(shutdown.clone());

    let server = {
        let bridge = bridge.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { bridge.serve(listener, shutdown).await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down...");

    shutdown.cancel();
    if let Err(e) = server.await {
        error!("Bridge listener task failed: {}", e);
    }
    if let Err(e) = liveness.await {
        error!("Liveness task failed: {}", e);
    }

    for id in bridge.sessions().ids() {
        bridge.del_client(id).await;
    }

    info!("Tunnel bridge stopped");
    Ok(())
}
