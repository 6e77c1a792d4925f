//! llmfleet - on-demand gateway for a fleet of self-hosted model servers.
//!
//! This binary loads the catalogue, builds the gateway stack, and serves
//! the OpenAI-compatible surface plus the management API on one port.

use anyhow::{Context, Result};
use clap::Parser;
use llmfleet::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmfleet")]
#[command(about = "On-demand orchestrator and OpenAI-compatible gateway for local model servers")]
struct Args {
    /// Path to the model catalogue (JSON or YAML)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Backend process output is logged under the "backend" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,backend=debug.
    let filter = if args.verbose {
        EnvFilter::new("llmfleet=debug,backend=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting llmfleet");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.program.port = port;
    }

    info!(
        models = config.models.len(),
        devices = config.program.devices.len(),
        port = config.program.port,
        "Configuration loaded"
    );

    llmfleet::telemetry::install(config.program.metrics_port);

    let host = config.program.host.clone();
    let port = config.program.port;
    let (app, controller) = llmfleet::build_app(config)
        .await
        .context("Failed to build application")?;

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(addr = %addr, "Listening for requests");

    // Boot-time auto-start happens after the listener is up so the admin
    // API is reachable while models come online.
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            let started = controller.start_auto_start_models().await;
            if !started.is_empty() {
                info!(models = ?started, "Auto-start complete");
            }
        });
    }

    let shutdown_controller = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    shutdown_controller.shutdown().await;

    Ok(())
}
