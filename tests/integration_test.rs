//! Integration tests over the public router: management surface, billing
//! round trips, and the full lazy-start proxy path against the
//! mock-backend binary.

use axum::Router;
use axum::body::Body;
use http::{Request, StatusCode};
use llmfleet::Config;
use std::io::Write;
use std::time::Duration;
use tower::ServiceExt;

/// Build a gateway whose single Chat model launches the mock backend.
async fn build_gateway(
    model: &str,
    backend_port: u16,
) -> (Router, llmfleet::LifecycleController, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let script_path = dir.path().join("launch.sh");
    let mut script = std::fs::File::create(&script_path).unwrap();
    writeln!(
        script,
        "exec {} --port {} --model {}",
        env!("CARGO_BIN_EXE_mock-backend"),
        backend_port,
        model
    )
    .unwrap();

    let config_json = serde_json::json!({
        "program": {
            "port": 0,
            "metrics_port": 0,
            "db_path": dir.path().join("monitoring.db"),
            "idle_timeout_minutes": 15,
            "stop_grace_secs": 1,
            "devices": [
                {"id": "gpu0", "kind": "static", "total_mb": 16384}
            ]
        },
        "models": [
            {
                "aliases": [model, format!("{model}-alias")],
                "mode": "Chat",
                "port": backend_port,
                "variants": [
                    {
                        "name": "main",
                        "required_devices": ["gpu0"],
                        "memory_mb": {"gpu0": 4096},
                        "script": script_path
                    }
                ]
            }
        ]
    });

    let config: Config = serde_json::from_value(config_json).unwrap();
    let (app, controller) = llmfleet::build_app(config).await.unwrap();
    (app, controller, dir)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_and_catalogue() {
    let (app, _controller, _dir) = build_gateway("m1", 19101).await;

    let (status, json) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["models_count"], 1);
    assert_eq!(json["running_models"], 0);

    let (status, json) = get_json(&app, "/v1/models").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["object"], "list");
    assert_eq!(json["data"][0]["id"], "m1");
    assert_eq!(json["data"][0]["object"], "model");
    assert_eq!(json["data"][0]["mode"], "Chat");
    assert_eq!(json["data"][0]["aliases"][1], "m1-alias");

    let (status, json) = get_json(&app, "/api/info").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn model_info_resolves_aliases() {
    let (app, _controller, _dir) = build_gateway("m1", 19102).await;

    let (status, json) = get_json(&app, "/api/models/m1-alias/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["model"]["status"], "stopped");
    assert_eq!(json["model"]["is_available"], true);

    let (status, json) = get_json(&app, "/api/models/all-models/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_models"], 1);
    assert_eq!(json["running_models"], 0);

    let (status, json) = get_json(&app, "/api/models/ghost/info").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "model_not_found");
}

#[tokio::test]
async fn proxy_rejects_unknown_model_and_wrong_mode() {
    let (app, _controller, _dir) = build_gateway("m1", 19103).await;

    let (status, json) = post_json(
        &app,
        "/v1/chat/completions",
        serde_json::json!({"model": "ghost", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "model_not_found");

    // m1 is Chat mode; text completions must be refused before any start.
    let (status, json) = post_json(
        &app,
        "/v1/completions",
        serde_json::json!({"model": "m1", "prompt": "hi"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "mode_mismatch");
}

#[tokio::test]
async fn proxy_requires_model_field() {
    let (app, _controller, _dir) = build_gateway("m1", 19110).await;

    // No model field at all is a validation failure, not a lookup miss.
    let (status, json) =
        post_json(&app, "/v1/chat/completions", serde_json::json!({"messages": []})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "invalid_request");

    // Same for a body that is not JSON.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn on_demand_start_proxies_and_records() {
    let (app, controller, _dir) = build_gateway("m1", 19104).await;

    // First request lazily starts the backend, waits for health, forwards.
    let (status, json) = post_json(
        &app,
        "/v1/chat/completions",
        serde_json::json!({
            "model": "m1-alias",
            "messages": [{"role": "user", "content": "hello"}],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["choices"][0]["message"]["content"], "mock reply");
    assert_eq!(json["usage"]["prompt_tokens"], 12);

    assert!(controller.is_routing("m1").await);
    assert_eq!(controller.in_flight_count("m1"), 0);

    // The request record lands asynchronously.
    let mut recorded = 0;
    for _ in 0..100 {
        recorded = controller.store().request_count("m1").await.unwrap();
        if recorded >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(recorded >= 1, "request record was not written");

    // Second request hits the already-routing fast path.
    let (status, _json) = post_json(
        &app,
        "/v1/chat/completions",
        serde_json::json!({"model": "m1", "messages": []}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = post_json(&app, "/api/models/m1/stop", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(!controller.is_routing("m1").await);
}

#[tokio::test]
async fn streaming_response_is_forwarded_with_usage() {
    let (app, controller, _dir) = build_gateway("m1", 19105).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"model": "m1", "messages": [], "stream": true}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    assert!(content_type.contains("text/event-stream"), "{content_type}");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("data:"));
    assert!(text.contains("[DONE]"));

    // Usage from the final frame makes it into the store.
    let mut records = Vec::new();
    for _ in 0..100 {
        records = controller
            .store()
            .requests_in("m1", 0.0, f64::MAX)
            .await
            .unwrap();
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!records.is_empty());
    assert_eq!(records[0].in_tok, 12);
    assert_eq!(records[0].out_tok, 2);
    assert_eq!(records[0].cache_n, 4);
    assert_eq!(records[0].prompt_n, 8);

    controller.stop("m1").await.unwrap();
}

#[tokio::test]
async fn explicit_start_and_stop_endpoints() {
    let (app, controller, _dir) = build_gateway("m1", 19106).await;

    let (status, json) = post_json(&app, "/api/models/m1-alias/start", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(controller.is_routing("m1").await);

    let (_status, json) = get_json(&app, "/api/models/m1/info").await;
    assert_eq!(json["model"]["status"], "routing");
    assert!(json["model"]["pid"].is_number());

    let (status, json) = post_json(&app, "/api/models/stop-all", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stopped_models"][0], "m1");

    // Stopping an already stopped model stays idempotent.
    let (status, json) = post_json(&app, "/api/models/m1/stop", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn billing_round_trip() {
    let (app, _controller, _dir) = build_gateway("m1", 19107).await;

    // Seeded default: tiered with one zero-price tier.
    let (status, json) = get_json(&app, "/api/billing/models/m1/pricing").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["pricing_type"], "tier");
    assert_eq!(json["data"]["tier_pricing"].as_array().unwrap().len(), 1);

    let tier = serde_json::json!({
        "tier_index": 2,
        "min_input_tokens": 1000,
        "max_input_tokens": -1,
        "min_output_tokens": 0,
        "max_output_tokens": -1,
        "input_price": 2.0,
        "output_price": 4.0,
        "support_cache": true,
        "cache_write_price": 0.0,
        "cache_read_price": 0.5
    });
    let (status, _json) = post_json(&app, "/api/billing/models/m1/pricing/tier", tier).await;
    assert_eq!(status, StatusCode::OK);

    let (_status, json) = get_json(&app, "/api/billing/models/m1/pricing").await;
    let tiers = json["data"]["tier_pricing"].as_array().unwrap();
    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[1]["tier_index"], 2);
    assert_eq!(tiers[1]["cache_read_price"], 0.5);

    // Hourly price and billing mode switch.
    let (status, _json) = post_json(
        &app,
        "/api/billing/models/m1/pricing/hourly",
        serde_json::json!({"hourly_price": 3.5}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _json) =
        post_json(&app, "/api/billing/models/m1/pricing/set/hourly", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (_status, json) = get_json(&app, "/api/billing/models/m1/pricing").await;
    assert_eq!(json["data"]["pricing_type"], "hourly");
    assert_eq!(json["data"]["hourly_price"], 3.5);

    let (status, json) =
        post_json(&app, "/api/billing/models/m1/pricing/set/weekly", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");

    // Deleting down to the last tier is rejected.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/billing/models/m1/pricing/tier/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/billing/models/m1/pricing/tier/2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "last_tier_deletion");
}

#[tokio::test]
async fn analytics_endpoints_respond() {
    let (app, _controller, _dir) = build_gateway("m1", 19108).await;

    let (status, json) = get_json(&app, "/api/metrics/throughput/0/100/10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["time_points"].as_array().unwrap().len(), 10);
    assert!(json["data"]["mode_breakdown"]["Chat"].is_array());

    let (status, _json) = get_json(&app, "/api/analytics/token-trends/0/100/5").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _json) = get_json(&app, "/api/analytics/cost-trends/0/100/5").await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = get_json(&app, "/api/analytics/usage-summary/0/100").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["overall_summary"]["total_tokens"], 0);

    let (status, json) = get_json(&app, "/api/analytics/model-stats/m1-alias/0/100/4").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["model_name"], "m1");

    let (status, json) = get_json(&app, "/api/metrics/throughput/current-session").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"]["session_total"]["session_start_time"].is_number());

    // Inverted windows are validation failures.
    let (status, json) = get_json(&app, "/api/analytics/usage-summary/100/0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_request");
}

#[tokio::test]
async fn logs_and_devices_and_data_admin() {
    let (app, controller, _dir) = build_gateway("m1", 19109).await;

    controller.fanout().append("m1", "a line");

    let (status, json) = get_json(&app, "/api/logs/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stats"]["model_stats"]["m1"]["log_count"], 1);

    let (status, json) = post_json(&app, "/api/logs/m1-alias/clear", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["removed"], 1);

    let (status, json) = get_json(&app, "/api/devices/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["devices"]["gpu0"]["online"], true);
    assert_eq!(json["devices"]["gpu0"]["info"]["total_mb"], 16384);

    let (status, json) = get_json(&app, "/api/data/models/orphaned").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["count"], 0);

    let (status, json) = get_json(&app, "/api/data/storage/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["data"]["database_exists"].as_bool().unwrap());

    // Catalogued models cannot be dropped.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/data/models/m1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["error"], "orphan_protected");
}
