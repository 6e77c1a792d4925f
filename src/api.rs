//! Management API: model control, log streaming, device info, metrics,
//! analytics, billing, and data administration.
//!
//! Success responses carry `{"success": true, ...}`; every error funnels
//! through [`GatewayError`] into `{"success": false, "message", "error"}`
//! with the status code for its kind.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use crate::AppState;
use crate::errors::GatewayError;
use crate::store::Tier;
use crate::unix_ts;

/// Build the management routes. The caller attaches the proxy fallback.
pub fn management_router() -> Router<AppState> {
    Router::new()
        .route("/", get(service_info))
        .route("/api/info", get(service_info))
        .route("/health", get(health))
        .route("/api/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/api/models/restart-autostart", post(restart_autostart))
        .route("/api/models/stop-all", post(stop_all))
        .route("/api/models/{alias}/info", get(model_info))
        .route("/api/models/{alias}/start", post(start_model))
        .route("/api/models/{alias}/stop", post(stop_model))
        .route("/api/models/{alias}/logs/stream", get(stream_logs))
        .route("/api/logs/stats", get(log_stats))
        .route("/api/logs/{alias}/clear", post(clear_logs))
        .route("/api/logs/{alias}/clear/{keep_minutes}", post(clear_logs_path))
        .route("/api/devices/info", get(device_info))
        .route(
            "/api/metrics/throughput/current-session",
            get(current_session),
        )
        .route("/api/metrics/throughput/{t0}/{t1}/{n}", get(throughput))
        .route("/api/analytics/usage-summary/{t0}/{t1}", get(usage_summary))
        .route("/api/analytics/token-trends/{t0}/{t1}/{n}", get(token_trends))
        .route("/api/analytics/cost-trends/{t0}/{t1}/{n}", get(cost_trends))
        .route(
            "/api/analytics/model-stats/{alias}/{t0}/{t1}/{n}",
            get(model_stats),
        )
        .route("/api/billing/models/{name}/pricing", get(get_pricing))
        .route("/api/billing/models/{name}/pricing/tier", post(upsert_tier))
        .route(
            "/api/billing/models/{name}/pricing/tier/{idx}",
            delete(delete_tier),
        )
        .route("/api/billing/models/{name}/pricing/hourly", post(set_hourly))
        .route(
            "/api/billing/models/{name}/pricing/set/{method}",
            post(set_billing_method),
        )
        .route("/api/data/models/orphaned", get(orphaned_models))
        .route("/api/data/storage/stats", get(storage_stats))
        .route("/api/data/models/{name}", delete(delete_model_data))
}

fn resolve(state: &AppState, alias: &str) -> Result<String, GatewayError> {
    state
        .controller
        .catalogue()
        .resolve(alias)
        .map(String::from)
        .ok_or_else(|| GatewayError::ModelNotFound(alias.to_string()))
}

fn catalogue_set(state: &AppState) -> BTreeSet<String> {
    state.controller.catalogue().names().map(String::from).collect()
}

// ---------------------------------------------------------------------------
// Service identity and catalogue
// ---------------------------------------------------------------------------

async fn service_info() -> Json<serde_json::Value> {
    Json(json!({
        "message": "llmfleet gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "models_url": "/v1/models",
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "models_count": state.controller.models_count(),
        "running_models": state.controller.running_count().await,
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let catalogue = state.controller.catalogue();
    let created = unix_ts() as i64;
    let data: Vec<_> = catalogue
        .names()
        .filter_map(|name| catalogue.get(name))
        .map(|model| {
            json!({
                "id": model.name(),
                "object": "model",
                "created": created,
                "owned_by": "llmfleet",
                "aliases": model.aliases.clone(),
                "mode": model.mode.clone(),
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}

// ---------------------------------------------------------------------------
// Model control
// ---------------------------------------------------------------------------

async fn model_info(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if alias == "all-models" {
        let models = state.controller.all_status().await;
        let total = models.len();
        let running = models.values().filter(|m| m.status == "routing").count();
        let pending: usize = models.values().map(|m| m.in_flight).sum();
        return Ok(Json(json!({
            "success": true,
            "models": models,
            "total_models": total,
            "running_models": running,
            "total_pending_requests": pending,
        })));
    }

    let canonical = resolve(&state, &alias)?;
    let status = state
        .controller
        .status(&canonical)
        .await
        .ok_or_else(|| GatewayError::ModelNotFound(alias))?;
    Ok(Json(json!({"success": true, "model": status})))
}

async fn start_model(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &alias)?;
    // Admin starts carry no health deadline; cancellation via stop still
    // applies.
    state.controller.ensure_running(&canonical, false).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("model '{canonical}' is routing"),
    })))
}

async fn stop_model(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &alias)?;
    state.controller.stop(&canonical).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("model '{canonical}' stopped"),
    })))
}

async fn restart_autostart(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    info!("restarting auto-start models");
    state.controller.stop_all().await;
    let started = state.controller.start_auto_start_models().await;
    Ok(Json(json!({
        "success": true,
        "message": format!("restarted {} auto-start models", started.len()),
        "started_models": started,
    })))
}

async fn stop_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let stopped = state.controller.stop_all().await;
    Ok(Json(json!({
        "success": true,
        "message": format!("stopped {} models", stopped.len()),
        "stopped_models": stopped,
    })))
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

async fn stream_logs(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let canonical = resolve(&state, &alias)?;
    let (snapshot, mut rx) = state.controller.fanout().subscribe(&canonical);

    let stream = async_stream::stream! {
        for entry in snapshot {
            yield Ok(Event::default()
                .data(json!({"type": "historical", "log": entry}).to_string()));
        }
        yield Ok(Event::default().data(json!({"type": "historical_complete"}).to_string()));

        loop {
            match rx.recv().await {
                Ok(entry) => {
                    yield Ok(Event::default()
                        .data(json!({"type": "realtime", "log": entry}).to_string()));
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Slow consumer: cut it rather than stall the producer.
                    yield Ok(Event::default().data(
                        json!({
                            "type": "error",
                            "message": format!("subscriber lagged, {skipped} messages dropped"),
                        })
                        .to_string(),
                    ));
                    break;
                }
                Err(RecvError::Closed) => {
                    yield Ok(Event::default().data(json!({"type": "stream_end"}).to_string()));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn log_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "stats": state.controller.fanout().stats()}))
}

#[derive(Deserialize)]
struct ClearParams {
    #[serde(default)]
    keep_minutes: u64,
}

async fn clear_logs(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(params): Query<ClearParams>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    clear_logs_inner(state, alias, params.keep_minutes).await
}

async fn clear_logs_path(
    State(state): State<AppState>,
    Path((alias, keep_minutes)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    clear_logs_inner(state, alias, keep_minutes).await
}

async fn clear_logs_inner(
    state: AppState,
    alias: String,
    keep_minutes: u64,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &alias)?;
    let removed = state.controller.fanout().clear(&canonical, keep_minutes);
    let message = if keep_minutes == 0 {
        format!("cleared all logs for '{canonical}' ({removed} entries)")
    } else {
        format!(
            "cleared logs older than {keep_minutes} minutes for '{canonical}' ({removed} entries)"
        )
    };
    Ok(Json(json!({"success": true, "message": message, "removed": removed})))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

async fn device_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut devices = serde_json::Map::new();
    for (id, online, snapshot) in state.controller.devices().info_all().await {
        devices.insert(id, json!({"online": online, "info": snapshot}));
    }
    Json(json!({"success": true, "devices": devices}))
}

// ---------------------------------------------------------------------------
// Metrics and analytics
// ---------------------------------------------------------------------------

async fn throughput(
    State(state): State<AppState>,
    Path((t0, t1, n)): Path<(f64, f64, usize)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let data = state.analytics.throughput(t0, t1, n).await?;
    Ok(Json(json!({"success": true, "data": data})))
}

async fn current_session(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let totals = state.analytics.session_totals().await?;
    Ok(Json(json!({"success": true, "data": {"session_total": totals}})))
}

async fn usage_summary(
    State(state): State<AppState>,
    Path((t0, t1)): Path<(f64, f64)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let data = state.analytics.usage_summary(t0, t1).await?;
    Ok(Json(json!({"success": true, "data": data})))
}

async fn token_trends(
    State(state): State<AppState>,
    Path((t0, t1, n)): Path<(f64, f64, usize)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let data = state.analytics.token_trends(t0, t1, n).await?;
    Ok(Json(json!({"success": true, "data": data})))
}

async fn cost_trends(
    State(state): State<AppState>,
    Path((t0, t1, n)): Path<(f64, f64, usize)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let data = state.analytics.cost_trends(t0, t1, n).await?;
    Ok(Json(json!({"success": true, "data": data})))
}

async fn model_stats(
    State(state): State<AppState>,
    Path((alias, t0, t1, n)): Path<(String, f64, f64, usize)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &alias)?;
    let data = state.analytics.model_stats(&canonical, t0, t1, n).await?;
    Ok(Json(json!({"success": true, "data": data})))
}

// ---------------------------------------------------------------------------
// Billing
// ---------------------------------------------------------------------------

async fn get_pricing(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &name)?;
    let billing = state.controller.store().billing(&canonical).await?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "model_name": canonical,
            "pricing_type": if billing.use_tiered { "tier" } else { "hourly" },
            "tier_pricing": billing.tiers,
            "hourly_price": billing.hourly_price,
        }
    })))
}

async fn upsert_tier(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(tier): Json<Tier>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &name)?;
    state.controller.store().upsert_tier(&canonical, &tier).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("tier {} updated for '{canonical}'", tier.tier_index),
    })))
}

async fn delete_tier(
    State(state): State<AppState>,
    Path((name, idx)): Path<(String, i64)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &name)?;
    state.controller.store().delete_tier(&canonical, idx).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("tier {idx} removed from '{canonical}'"),
    })))
}

#[derive(Deserialize)]
struct HourlyBody {
    hourly_price: f64,
}

async fn set_hourly(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<HourlyBody>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &name)?;
    state
        .controller
        .store()
        .set_hourly_price(&canonical, body.hourly_price)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("hourly price for '{canonical}' set to {}", body.hourly_price),
    })))
}

async fn set_billing_method(
    State(state): State<AppState>,
    Path((name, method)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let canonical = resolve(&state, &name)?;
    let use_tiered = match method.as_str() {
        "tier" => true,
        "hourly" => false,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown billing method '{other}', use 'tier' or 'hourly'"
            )));
        }
    };
    state
        .controller
        .store()
        .set_billing_mode(&canonical, use_tiered)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("billing method for '{canonical}' set to '{method}'"),
    })))
}

// ---------------------------------------------------------------------------
// Data administration
// ---------------------------------------------------------------------------

async fn orphaned_models(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let orphans = state
        .controller
        .store()
        .list_orphans(&catalogue_set(&state))
        .await?;
    let count = orphans.len();
    Ok(Json(json!({
        "success": true,
        "data": {"orphaned_models": orphans, "count": count},
    })))
}

async fn storage_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let stats = state.controller.store().storage_stats().await?;
    Ok(Json(json!({"success": true, "data": stats})))
}

async fn delete_model_data(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    state
        .controller
        .store()
        .drop_model(&name, &catalogue_set(&state))
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("data for '{name}' deleted"),
    })))
}
