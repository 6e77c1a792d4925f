//! Mock OpenAI-compatible backend for testing llmfleet.
//!
//! Serves minimal chat, completion, embedding, and rerank endpoints with a
//! `usage` object in every response, plus a trailing usage frame on
//! streaming chat responses. Launch scripts in integration tests point at
//! this binary so the full start/probe/forward path can run without real
//! model servers.

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock OpenAI-compatible backend for testing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "18001")]
    port: u16,

    /// Model name to report
    #[arg(short, long, default_value = "mock-model")]
    model: String,

    /// Artificial startup delay before binding (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Artificial per-request latency (ms)
    #[arg(long, default_value = "10")]
    latency_ms: u64,
}

struct MockState {
    model: String,
    latency: Duration,
    request_count: AtomicU64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .init();

    let args = Args::parse();

    if args.startup_delay_ms > 0 {
        info!(delay_ms = args.startup_delay_ms, "simulating slow startup");
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let state = Arc::new(MockState {
        model: args.model.clone(),
        latency: Duration::from_millis(args.latency_ms),
        request_count: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/rerank", post(rerank))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, model = %args.model, "mock backend listening");
    println!("mock backend ready on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

type AppState = axum::extract::State<Arc<MockState>>;

async fn list_models(axum::extract::State(state): AppState) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{"id": state.model.clone(), "object": "model", "created": 0, "owned_by": "mock"}],
    }))
}

async fn chat(
    axum::extract::State(state): AppState,
    Json(body): Json<serde_json::Value>,
) -> Response {
    tokio::time::sleep(state.latency).await;
    let n = state.request_count.fetch_add(1, Ordering::SeqCst);
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if stream {
        let frames = [
            json!({"id": format!("cmpl-{n}"), "object": "chat.completion.chunk", "model": state.model.clone(),
                   "choices": [{"index": 0, "delta": {"role": "assistant", "content": "mock "}}]}),
            json!({"id": format!("cmpl-{n}"), "object": "chat.completion.chunk", "model": state.model.clone(),
                   "choices": [{"index": 0, "delta": {"content": "reply"}, "finish_reason": "stop"}]}),
            json!({"id": format!("cmpl-{n}"), "object": "chat.completion.chunk", "model": state.model.clone(),
                   "choices": [],
                   "usage": {"prompt_tokens": 12, "completion_tokens": 2},
                   "timings": {"cache_n": 4, "prompt_n": 8}}),
        ];
        let mut sse = String::new();
        for frame in &frames {
            sse.push_str(&format!("data: {frame}\n\n"));
        }
        sse.push_str("data: [DONE]\n\n");

        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from(sse))
            .unwrap()
            .into_response();
    }

    Json(json!({
        "id": format!("cmpl-{n}"),
        "object": "chat.completion",
        "model": state.model.clone(),
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "mock reply"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 2, "total_tokens": 14},
        "timings": {"cache_n": 4, "prompt_n": 8},
    }))
    .into_response()
}

async fn completions(axum::extract::State(state): AppState) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    Json(json!({
        "id": "cmpl-0",
        "object": "text_completion",
        "model": state.model.clone(),
        "choices": [{"index": 0, "text": "mock", "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
    }))
}

async fn embeddings(axum::extract::State(state): AppState) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    Json(json!({
        "object": "list",
        "model": state.model.clone(),
        "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2, 0.3]}],
        "usage": {"prompt_tokens": 5, "completion_tokens": 0, "total_tokens": 5},
    }))
}

async fn rerank(axum::extract::State(state): AppState) -> Json<serde_json::Value> {
    tokio::time::sleep(state.latency).await;
    Json(json!({
        "model": state.model.clone(),
        "results": [{"index": 0, "relevance_score": 0.9}],
        "usage": {"prompt_tokens": 6, "completion_tokens": 0, "total_tokens": 6},
    }))
}
