//! # llmfleet
//!
//! On-demand fleet orchestrator and OpenAI-compatible gateway for
//! self-hosted model servers. One public endpoint fronts a pool of backend
//! processes: requests are routed by model name, the target backend is
//! started lazily and health-checked before the first byte is forwarded,
//! idle backends are stopped to free device memory, and every request is
//! recorded for billing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       llmfleet                           │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Routing proxy (axum fallback)                      │  │
//! │  │ - extracts model from request body                 │  │
//! │  │ - validates path against the model's mode          │  │
//! │  │ - ensure_running + in-flight guard                 │  │
//! │  │ - streams the response, extracting usage tokens    │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Lifecycle controller                               │  │
//! │  │ - variant selection by device fit, admission,      │  │
//! │  │   eviction of idle models, idle sweeper            │  │
//! │  │ - one start at a time, coalesced waiters           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                          │                               │
//! │      ┌───────────────────┼───────────────────┐           │
//! │      ▼                   ▼                   ▼           │
//! │  [backend:18001]    [backend:18002]    [backend:18003]   │
//! │   launch scripts / stdout+stderr -> log fan-out (SSE)    │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod analytics;
pub mod api;
pub mod config;
pub mod devices;
pub mod errors;
pub mod interfaces;
pub mod lifecycle;
pub mod logs;
pub mod process;
pub mod proxy;
pub mod store;
pub mod telemetry;

pub use analytics::Analytics;
pub use config::{Catalogue, Config, LaunchVariant, ModelConfig, ProgramConfig};
pub use devices::{DeviceAdapter, DeviceRegistry, DeviceSnapshot};
pub use errors::GatewayError;
pub use interfaces::{InterfaceAdapter, InterfaceRegistry};
pub use lifecycle::{LifecycleController, ModelState};
pub use logs::LogFanout;
pub use store::AccountingStore;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tracing::info;

/// Epoch seconds as a float, the timestamp unit used throughout.
pub(crate) fn unix_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: LifecycleController,
    pub analytics: Arc<Analytics>,
    pub client: proxy::ProxyClient,
}

/// Build the complete gateway stack from a validated config.
///
/// Returns the public router (management API plus OpenAI proxy fallback)
/// and the lifecycle controller for shutdown handling. Background tasks
/// (idle sweeper, runtime heartbeat) are spawned here. Auto-start models
/// are not started; call [`LifecycleController::start_auto_start_models`]
/// once the listener is up.
pub async fn build_app(config: Config) -> Result<(Router, LifecycleController)> {
    let interfaces = Arc::new(InterfaceRegistry::builtin());
    let devices = Arc::new(
        DeviceRegistry::from_specs(&config.program.devices, config.program.snapshot_ttl())
            .context("Failed to build device registry")?,
    );

    config
        .validate(&devices.ids(), &interfaces.modes())
        .context("Invalid configuration")?;

    let catalogue = Arc::new(Catalogue::new(&config));
    let names: Vec<String> = catalogue.names().map(String::from).collect();
    let store = Arc::new(
        AccountingStore::open(&config.program.db_path, &names)
            .await
            .context("Failed to open accounting store")?,
    );
    store.program_runtime_open(unix_ts()).await?;

    let fanout = Arc::new(LogFanout::new());
    let controller = LifecycleController::new(
        Arc::clone(&catalogue),
        devices,
        interfaces,
        Arc::clone(&store),
        fanout,
        &config.program,
    );
    controller.spawn_background_tasks();

    let state = AppState {
        controller: controller.clone(),
        analytics: Arc::new(Analytics::new(store, catalogue)),
        client: proxy::build_client(),
    };

    info!(models = config.models.len(), "Gateway stack built");

    let app = api::management_router()
        .fallback(proxy::proxy_handler)
        .with_state(state);

    Ok((app, controller))
}
