//! Mindcycle - consciousness cycle engine launcher
//!
//! Usage:
//!   mindcycle --config mindcycle.toml
//!   mindcycle --mode dream --port 18800
//!   mindcycle --dump-config > mindcycle.toml
//!
//! Launches the cycle engine and the display gateway on one runtime.
//! Ctrl-C stops the gateway, then the engine.

use clap::Parser;
use mindcycle_core::Mode;
use mindcycle_engine::broadcast::ChannelBroadcaster;
use mindcycle_engine::config::MindcycleConfig;
use mindcycle_engine::noop::DisabledRenderer;
use mindcycle_engine::ports::PersistenceStore;
use mindcycle_engine::store::{JsonFileStore, MemoryStore};
use mindcycle_engine::{Collaborators, CycleEngine};
use mindcycle_gateway::{start_gateway, GatewayState};
use mindcycle_llm::AnthropicProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mindcycle", about = "Fixed-cadence consciousness cycle engine")]
struct Cli {
    /// Path to config file (TOML). Default: ./mindcycle.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dump default config as TOML and exit.
    #[arg(long)]
    dump_config: bool,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Start mode, overrides [cycle].start_mode (live | dream)
    #[arg(long)]
    mode: Option<Mode>,

    /// Gateway port, overrides [gateway].port
    #[arg(short, long)]
    port: Option<u16>,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        println!("{}", MindcycleConfig::default().to_toml());
        return Ok(());
    }

    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from("mindcycle.toml"));
    let mut config = MindcycleConfig::load(&config_path);
    if let Some(mode) = cli.mode {
        config.cycle.start_mode = mode;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let api_key = cli
        .api_key
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .ok_or_else(|| {
            anyhow::anyhow!("ANTHROPIC_API_KEY not set. Pass --api-key or set the env var.")
        })?;

    let mut llm = AnthropicProvider::new(api_key);
    if let Ok(api_url) = std::env::var("ANTHROPIC_API_URL") {
        info!("Using custom API URL: {}/v1/messages", api_url);
        llm = llm.with_base_url(format!("{}/v1/messages", api_url));
    }

    let store: Arc<dyn PersistenceStore> = match &config.store.path {
        Some(dir) => {
            info!("Store: {}", dir.display());
            Arc::new(JsonFileStore::open(dir.clone()).await?)
        }
        None => {
            warn!("No [store].path configured, history is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let broadcaster = ChannelBroadcaster::new(config.gateway.broadcast_capacity);
    let renderer = Arc::new(DisabledRenderer);
    let collab = Collaborators {
        llm: Arc::new(llm),
        store,
        renderer: renderer.clone(),
        rasterizer: renderer,
        broadcaster: Arc::new(broadcaster.clone()),
    };

    let engine = CycleEngine::new(&config, collab).await?;
    let (handle, engine_task) = engine.spawn();
    handle.start().await?;
    info!("Engine started in {} mode", config.cycle.start_mode);

    let state = Arc::new(GatewayState::new(handle.clone(), broadcaster.sender()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C handler failed: {}", e);
        }
        info!("Shutting down");
    };
    let served = start_gateway(&config.gateway, state, shutdown).await;

    if let Err(e) = handle.shutdown().await {
        warn!("Engine already gone: {}", e);
    }
    engine_task.await?;
    served
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file needs a file name: {}", path.display()))?;
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mindcycle=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
