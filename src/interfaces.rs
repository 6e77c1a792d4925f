//! Interface adapters: per-mode health probing and request-path validation.
//!
//! One adapter per mode, registered in an explicit table rather than
//! discovered at runtime. Health checks are two-phase: a liveness probe
//! (the backend accepts `GET /v1/models`) followed by a functional probe
//! (a minimal mode-appropriate request). Probing is deadline-based with
//! fixed pacing and is cancellable at every await point.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Endpoints the gateway understands; used to reject cross-mode requests.
const KNOWN_ENDPOINTS: &[&str] = &[
    "v1/chat/completions",
    "v1/completions",
    "v1/embeddings",
    "v1/rerank",
];

/// Pacing between probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// A mode adapter: knows which endpoints the mode serves, whether a request
/// path is compatible, and how to decide a freshly spawned backend is ready.
#[async_trait]
pub trait InterfaceAdapter: Send + Sync {
    fn mode(&self) -> &str;

    /// Path prefixes this mode serves.
    fn endpoints(&self) -> &[&'static str];

    /// Check that `path` is compatible with this mode. Paths that belong to
    /// a different mode's endpoint are rejected; unknown `v1/*` paths pass
    /// through untouched.
    fn validate(&self, path: &str, model: &str) -> Result<(), String> {
        for known in KNOWN_ENDPOINTS {
            if path.contains(known) && !self.endpoints().contains(known) {
                return Err(format!(
                    "model '{model}' is '{}' mode and does not serve {known}",
                    self.mode()
                ));
            }
        }
        Ok(())
    }

    /// Minimal functional request proving the backend actually serves this
    /// mode: (path, JSON body).
    fn probe_request(&self, model: &str) -> (&'static str, serde_json::Value);

    /// Block until the backend on `port` is healthy, the deadline passes,
    /// or the token is cancelled. `deadline = None` means probe until
    /// cancelled (the admin start path).
    async fn health(
        &self,
        model: &str,
        port: u16,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        // Phase 1: liveness. The socket accepts and the server answers.
        probe_until(deadline, cancel, || async {
            http_probe(port, Method::GET, "/v1/models", None).await
        })
        .await
        .map_err(|e| format!("liveness probe failed: {e}"))?;
        debug!(model = %model, port, mode = %self.mode(), "liveness probe passed");

        // Phase 2: function. A minimal mode-appropriate request succeeds.
        let (path, body) = self.probe_request(model);
        probe_until(deadline, cancel, || async {
            http_probe(port, Method::POST, path, Some(body.to_string())).await
        })
        .await
        .map_err(|e| format!("functional probe failed: {e}"))?;
        debug!(model = %model, port, mode = %self.mode(), "functional probe passed");

        Ok(())
    }
}

/// Repeat `attempt` with fixed pacing until it succeeds, the deadline
/// passes, or the token fires. No busy loop: every wait is an await.
async fn probe_until<F, Fut>(
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    attempt: F,
) -> Result<(), String>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut last_error = "not attempted".to_string();
    loop {
        if cancel.is_cancelled() {
            return Err("cancelled".to_string());
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(format!("deadline exceeded ({last_error})"));
            }
        }

        let attempt_fut = attempt();
        tokio::select! {
            result = attempt_fut => match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    trace!(error = %e, "probe attempt failed");
                    last_error = e;
                }
            },
            _ = cancel.cancelled() => return Err("cancelled".to_string()),
        }

        tokio::select! {
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            _ = cancel.cancelled() => return Err("cancelled".to_string()),
        }
    }
}

/// One bounded HTTP attempt against the local backend; success is any 2xx.
async fn http_probe(
    port: u16,
    method: Method,
    path: &str,
    body: Option<String>,
) -> Result<(), String> {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    let uri = format!("http://127.0.0.1:{port}{path}")
        .parse::<hyper::Uri>()
        .map_err(|e| format!("invalid probe URI: {e}"))?;

    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let request = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| format!("failed to build probe request: {e}"))?;

    let response = tokio::time::timeout(ATTEMPT_TIMEOUT, client.request(request))
        .await
        .map_err(|_| "probe attempt timed out".to_string())?
        .map_err(|e| format!("probe request failed: {e}"))?;

    let status = response.status();
    // Drain the body so the connection can be reused.
    let _ = response.into_body().collect().await;

    if status.is_success() {
        Ok(())
    } else {
        Err(format!("probe returned {status}"))
    }
}

// ---------------------------------------------------------------------------
// Built-in modes
// ---------------------------------------------------------------------------

pub struct ChatInterface;

#[async_trait]
impl InterfaceAdapter for ChatInterface {
    fn mode(&self) -> &str {
        "Chat"
    }

    fn endpoints(&self) -> &[&'static str] {
        &["v1/chat/completions"]
    }

    fn probe_request(&self, model: &str) -> (&'static str, serde_json::Value) {
        (
            "/v1/chat/completions",
            serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 1,
                "stream": false,
            }),
        )
    }
}

pub struct BaseInterface;

#[async_trait]
impl InterfaceAdapter for BaseInterface {
    fn mode(&self) -> &str {
        "Base"
    }

    fn endpoints(&self) -> &[&'static str] {
        &["v1/completions"]
    }

    fn probe_request(&self, model: &str) -> (&'static str, serde_json::Value) {
        (
            "/v1/completions",
            serde_json::json!({
                "model": model,
                "prompt": "hello",
                "max_tokens": 1,
                "stream": false,
            }),
        )
    }
}

pub struct EmbeddingInterface;

#[async_trait]
impl InterfaceAdapter for EmbeddingInterface {
    fn mode(&self) -> &str {
        "Embedding"
    }

    fn endpoints(&self) -> &[&'static str] {
        &["v1/embeddings"]
    }

    fn probe_request(&self, model: &str) -> (&'static str, serde_json::Value) {
        (
            "/v1/embeddings",
            serde_json::json!({"model": model, "input": "hello"}),
        )
    }
}

pub struct RerankerInterface;

#[async_trait]
impl InterfaceAdapter for RerankerInterface {
    fn mode(&self) -> &str {
        "Reranker"
    }

    fn endpoints(&self) -> &[&'static str] {
        &["v1/rerank"]
    }

    fn probe_request(&self, model: &str) -> (&'static str, serde_json::Value) {
        (
            "/v1/rerank",
            serde_json::json!({"model": model, "query": "q", "documents": ["d"]}),
        )
    }
}

/// Registry of mode adapters.
pub struct InterfaceRegistry {
    adapters: HashMap<String, Arc<dyn InterfaceAdapter>>,
}

impl InterfaceRegistry {
    /// The built-in registration table.
    pub fn builtin() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Arc::new(ChatInterface));
        registry.register(Arc::new(BaseInterface));
        registry.register(Arc::new(EmbeddingInterface));
        registry.register(Arc::new(RerankerInterface));
        registry
    }

    /// Register an adapter; later registrations shadow earlier ones.
    pub fn register(&mut self, adapter: Arc<dyn InterfaceAdapter>) {
        self.adapters.insert(adapter.mode().to_string(), adapter);
    }

    pub fn get(&self, mode: &str) -> Option<&Arc<dyn InterfaceAdapter>> {
        self.adapters.get(mode)
    }

    pub fn modes(&self) -> BTreeSet<String> {
        self.adapters.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_modes_registered() {
        let registry = InterfaceRegistry::builtin();
        let modes = registry.modes();
        for mode in ["Chat", "Base", "Embedding", "Reranker"] {
            assert!(modes.contains(mode), "missing mode {mode}");
        }
    }

    #[test]
    fn endpoints_per_mode() {
        let registry = InterfaceRegistry::builtin();
        assert_eq!(
            registry.get("Chat").unwrap().endpoints(),
            &["v1/chat/completions"]
        );
        assert_eq!(registry.get("Base").unwrap().endpoints(), &["v1/completions"]);
        assert_eq!(
            registry.get("Embedding").unwrap().endpoints(),
            &["v1/embeddings"]
        );
        assert_eq!(registry.get("Reranker").unwrap().endpoints(), &["v1/rerank"]);
    }

    #[test]
    fn base_mode_rejects_chat_endpoint() {
        let base = BaseInterface;
        let err = base.validate("/v1/chat/completions", "m").unwrap_err();
        assert!(err.contains("Base"));
        base.validate("/v1/completions", "m").unwrap();
    }

    #[test]
    fn chat_mode_rejects_completions_endpoint() {
        let chat = ChatInterface;
        assert!(chat.validate("/v1/completions", "m").is_err());
        chat.validate("/v1/chat/completions", "m").unwrap();
    }

    #[test]
    fn unknown_paths_pass_through() {
        let chat = ChatInterface;
        chat.validate("/v1/audio/transcriptions", "m").unwrap();
    }

    #[tokio::test]
    async fn probe_until_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = probe_until(None, &cancel, || async { Err("nope".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "cancelled");
    }

    #[tokio::test]
    async fn probe_until_respects_deadline() {
        let cancel = CancellationToken::new();
        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let result = probe_until(deadline, &cancel, || async { Err("down".to_string()) }).await;
        assert!(result.unwrap_err().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn probe_until_returns_on_success() {
        let cancel = CancellationToken::new();
        probe_until(None, &cancel, || async { Ok(()) }).await.unwrap();
    }
}
