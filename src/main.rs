use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use cligate_lib::backends::BackendRegistry;
use cligate_lib::config::load_config;
use cligate_lib::server::{serve, AppState};
use cligate_lib::sessions::SessionStore;

#[derive(Parser, Debug)]
#[command(
    name = "cligate",
    version,
    about = "OpenAI-compatible chat completions backed by local AI coding CLIs"
)]
struct Args {
    /// Config file (default: <config dir>/cligate/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config file
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overriding the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let registry = BackendRegistry::detect(&config).await;
    if registry.is_empty() {
        log::warn!("No backend CLI found on PATH; every completion request will fail");
    }

    let ttl = Duration::from_secs(config.session_ttl_secs);
    let sessions = Arc::new(match &config.session_file {
        Some(path) => SessionStore::with_persistence(ttl, path.clone())?,
        None => SessionStore::new(ttl),
    });

    let shutdown = CancellationToken::new();
    let pruner = Arc::clone(&sessions).spawn_pruner(
        Duration::from_secs(config.prune_interval_secs.max(1)),
        shutdown.clone(),
    );

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down...");
            ctrl_c.cancel();
        }
    });

    let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| format!("Could not resolve {}:{}", config.host, config.port))?;

    let state = AppState {
        registry: Arc::new(registry),
        sessions: Arc::clone(&sessions),
    };
    let result = serve(addr, state, shutdown.clone().cancelled_owned()).await;

    shutdown.cancel();
    let _ = pruner.await;
    if let Err(e) = Arc::clone(&sessions).persist().await {
        log::warn!("Failed to persist sessions: {}", e);
    }
    result?;
    Ok(())
}
