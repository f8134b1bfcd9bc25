use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use dpmux::config::Config;
use dpmux::driver::{join_all, spawn_driver, Driver, PeerRole, Role, ShapedSide, Shutdown, UnshapedSide};
use dpmux::error::ShmError;
use dpmux::logging;
use dpmux::shaper::{NoiseGenerator, Scheduler};
use dpmux::shm::ShmArena;
use dpmux::transport::quic::{server_endpoint, QuicStreams};
use dpmux::transport::tcp::TcpSockets;
use dpmux::transport::{SocketEvents, StreamEvents};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

/// How long the shaped process waits for the unshaped process's region
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
const ATTACH_RETRY: Duration = Duration::from_millis(250);

/// dpmux traffic-shaping middlebox
#[derive(Parser)]
#[command(name = "dpmux")]
#[command(about = "Differentially private traffic shaping of multiplexed flows")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the unshaped process (plain TCP side); start this one first
    Unshaped {
        /// Path to the middlebox configuration file
        #[arg(long, default_value = "config/dpmux.yml")]
        config: PathBuf,
    },
    /// Run the shaped process (QUIC link to the peer middlebox)
    Shaped {
        /// Path to the middlebox configuration file
        #[arg(long, default_value = "config/dpmux.yml")]
        config: PathBuf,
    },
    /// Print the shared-memory layout for a configuration
    Layout {
        /// Path to the middlebox configuration file
        #[arg(long, default_value = "config/dpmux.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config_path, role) = match &cli.command {
        Commands::Unshaped { config } => (config, Role::Unshaped),
        Commands::Shaped { config } => (config, Role::Shaped),
        Commands::Layout { config } => {
            let config = Config::load(config).await?;
            println!("{}", config.layout()?);
            return Ok(());
        }
    };

    let config = Config::load(config_path).await?;

    logging::init_logging(
        role,
        &config.log_level,
        &config.log_theme_path,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )
    .await?;

    match role {
        Role::Unshaped => run_unshaped(config).await,
        Role::Shaped => run_shaped(config).await,
    }
}

async fn run_unshaped(config: Config) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let arena = Arc::new(
        ShmArena::create_named(&config.shm_dir(), &config.app_name, layout).context("Failed to create shared region")?,
    );

    let sockets = TcpSockets::new(
        Handle::current(),
        config.read_chunk(),
        Duration::from_micros(config.unshaped.backoff_us),
    );
    let side = Arc::new(UnshapedSide::new(sockets.clone(), arena, config.unshaped_options()));
    let handler: Arc<dyn SocketEvents> = side.clone();
    sockets.set_events(Arc::downgrade(&handler));

    let shutdown = Shutdown::new();
    let handles = spawn_driver(side.clone(), config.unshaped_intervals(), &shutdown)?;

    if config.role == PeerRole::Initiator {
        let listener = TcpListener::bind((config.unshaped.bind_address.as_str(), config.unshaped.bind_port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind {}:{}",
                    config.unshaped.bind_address, config.unshaped.bind_port
                )
            })?;
        let serving = sockets.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve(listener).await {
                tracing::error!("Listener failed: {}", e);
            }
        });
    }
    tracing::info!(role = ?config.role, max_flows = config.max_flows, "unshaped process running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    stop(shutdown, handles).await?;
    side.stats().log_summary(Role::Unshaped);
    Ok(())
}

async fn run_shaped(config: Config) -> anyhow::Result<()> {
    let layout = config.layout()?;
    let arena = Arc::new(attach_region(&config).await?);

    let quic = QuicStreams::new(
        Handle::current(),
        config.read_chunk(),
        Duration::from_micros(config.shaped.backoff_us),
    );
    let side = Arc::new(ShapedSide::new(quic.clone(), arena, config.shaped_options()));
    let handler: Arc<dyn StreamEvents> = side.clone();
    quic.set_events(Arc::downgrade(&handler));

    match config.role {
        PeerRole::Initiator => quic.dial(&config.shaped).await?,
        PeerRole::Responder => quic.accept_peer(server_endpoint(&config.shaped)?).await?,
    }

    // Opening streams blocks on the runtime
    let starter = side.clone();
    tokio::task::spawn_blocking(move || starter.start())
        .await
        .map_err(|e| anyhow!("Start task failed: {}", e))?
        .context("Failed to open reserved streams")?;

    let noise = NoiseGenerator::configure(config.shaper.noise())?;
    let scheduler = Arc::new(Scheduler::new(side.clone(), noise, config.shaper.timing()?));

    let shutdown = Shutdown::new();
    let mut handles = spawn_driver(side.clone(), config.shaped_intervals(), &shutdown)?;
    handles.extend(scheduler.clone().spawn(&shutdown)?);
    tracing::info!(role = ?config.role, max_flows = layout.max_flows(), "shaped process running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown signal received");
        }
        _ = quic.closed() => {
            tracing::warn!("Peer connection lost, shutting down");
        }
    }
    stop(shutdown, handles).await?;
    quic.shutdown().await;
    side.stats().log_summary(Role::Shaped);
    let stats = scheduler.stats();
    tracing::info!(
        decisions = stats.decisions.load(Ordering::Relaxed),
        data_bytes = stats.data_bytes.load(Ordering::Relaxed),
        dummy_bytes = stats.dummy_bytes.load(Ordering::Relaxed),
        "scheduler summary"
    );
    Ok(())
}

/// Attach to the unshaped process's region, waiting for it to appear
async fn attach_region(config: &Config) -> anyhow::Result<ShmArena> {
    let layout = config.layout()?;
    let dir = config.shm_dir();
    let start = tokio::time::Instant::now();
    loop {
        match ShmArena::attach_named(&dir, &config.app_name, layout) {
            Ok(arena) => return Ok(arena),
            Err(e @ (ShmError::UnshapedNotStarted | ShmError::Io { .. })) if start.elapsed() < ATTACH_TIMEOUT => {
                tracing::debug!(error = %e, "waiting for the unshaped process");
                tokio::time::sleep(ATTACH_RETRY).await;
            }
            Err(e) => return Err(e).context("Failed to attach shared region; is the unshaped process running?"),
        }
    }
}

async fn stop(shutdown: Shutdown, handles: Vec<JoinHandle<()>>) -> anyhow::Result<()> {
    shutdown.trigger();
    tokio::task::spawn_blocking(move || join_all(handles))
        .await
        .map_err(|e| anyhow!("Join task failed: {}", e))
}
