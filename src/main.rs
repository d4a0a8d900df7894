//! OBS Sync - Rust implementation
//!
//! Keeps several OBS Studio instances on a LAN visually identical by
//! mirroring a master operator's OBS state onto slave instances.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use obs_sync::api::{self, ApiState, DEFAULT_API_PORT};
use obs_sync::engine::{AppMode, ObsConnectConfig, SyncEngine};
use obs_sync::paths;
use obs_sync::settings::AppSettings;

/// OBS Sync - mirror a master OBS instance onto slaves over the LAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Role to start in; without it the shell picks one later
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Port the shell API listens on
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// Disable the shell API surface
    #[arg(long)]
    no_api: bool,

    /// Master listen port (master mode), overriding settings
    #[arg(long)]
    master_port: Option<u16>,

    /// Master host to dial (slave mode), overriding settings
    #[arg(long)]
    master_host: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Master,
    Slave,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Keep the file-writer guard alive for the whole run.
    let _log_guard = init_logging(&args.log_level)?;

    info!("Starting OBS Sync v{}...", SyncEngine::app_version());

    let settings = AppSettings::load_default().unwrap_or_else(|e| {
        warn!("Falling back to default settings: {}", e);
        AppSettings::default()
    });

    let engine = SyncEngine::new();

    // Connect to the local OBS with the persisted defaults. Failure is not
    // fatal; the shell can retry with different parameters.
    let obs_config = ObsConnectConfig::from(&settings.obs);
    if let Err(e) = engine.connect_obs(&obs_config).await {
        warn!(
            "OBS not reachable at {}:{} yet: {}",
            obs_config.host, obs_config.port, e
        );
    }

    match args.mode {
        Some(ModeArg::Master) => {
            engine.set_app_mode(AppMode::Master);
            let port = args.master_port.unwrap_or(settings.master.listen_port);
            engine.start_master_server(port).await?;
        }
        Some(ModeArg::Slave) => {
            engine.set_app_mode(AppMode::Slave);
            let host = args
                .master_host
                .clone()
                .unwrap_or_else(|| settings.slave.master_host.clone());
            let port = args.master_port.unwrap_or(settings.slave.master_port);
            engine.connect_to_master(&host, port).await?;
        }
        None => info!("No role selected yet; waiting for the shell"),
    }

    if !args.no_api {
        let state = Arc::new(ApiState {
            engine: engine.clone(),
        });
        let api_port = args.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::start_server(state, api_port).await {
                warn!("Shell API stopped: {:#}", e);
            }
        });
    }

    shutdown_signal().await;

    info!("Shutting down...");
    engine.shutdown().await;
    info!("OBS Sync shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(paths::logs_dir(), "obs-sync.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
