//! Routing proxy for the OpenAI-compatible surface.
//!
//! The handler reads the request body once to learn the target model,
//! resolves alias to canonical name, validates the path against the model's
//! mode, lazily starts the backend, then relays the request to
//! `127.0.0.1:<port>`. Streaming responses are forwarded frame by frame;
//! the response body is wrapped so the in-flight guard rides along until
//! the last byte and usage tokens are extracted from a bounded tail of the
//! stream. Token extraction is best-effort by contract: bad or missing
//! usage yields a zero record, never a client-visible error.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use metrics::{counter, histogram};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::AppState;
use crate::errors::GatewayError;
use crate::lifecycle::InFlightGuard;
use crate::store::{AccountingStore, RequestRecord};
use crate::unix_ts;

/// Bytes of response tail retained for usage extraction.
const USAGE_TAIL_LIMIT: usize = 256 * 1024;

pub type ProxyClient = Client<HttpConnector, Body>;

pub fn build_client() -> ProxyClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Token counts pulled from a backend response.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct UsageTokens {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_n: i64,
    pub prompt_n: i64,
}

impl UsageTokens {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        let usage = value.get("usage");
        let timings = value.get("timings");
        if usage.is_none() && timings.is_none() {
            return None;
        }

        let int = |obj: Option<&serde_json::Value>, key: &str| -> i64 {
            obj.and_then(|o| o.get(key)).and_then(|v| v.as_i64()).unwrap_or(0)
        };

        Some(Self {
            prompt_tokens: int(usage, "prompt_tokens"),
            completion_tokens: int(usage, "completion_tokens"),
            // Some backends report cache counters inside usage itself.
            cache_n: int(timings, "cache_n").max(int(usage, "cache_n")),
            prompt_n: int(timings, "prompt_n").max(int(usage, "prompt_n")),
        })
    }
}

/// Extract the `model` field from a JSON request body.
pub(crate) fn extract_model(body: &Bytes) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    json.get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Best-effort usage extraction from a (possibly truncated) response tail.
pub(crate) fn extract_usage(bytes: &[u8], is_sse: bool) -> UsageTokens {
    let text = String::from_utf8_lossy(bytes);

    if is_sse {
        // The usage frame, when present, is one of the last data frames
        // before [DONE]; scan from the end.
        for line in text.lines().rev() {
            let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
                if let Some(tokens) = UsageTokens::from_json(&value) {
                    return tokens;
                }
            }
        }
        return UsageTokens::default();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        if let Some(tokens) = UsageTokens::from_json(&value) {
            return tokens;
        }
        return UsageTokens::default();
    }

    // The tail may have lost the front of a large JSON body; fish the
    // usage and timings objects out directly.
    let usage = find_object_after(&text, "\"usage\"");
    let timings = find_object_after(&text, "\"timings\"");
    if usage.is_none() && timings.is_none() {
        return UsageTokens::default();
    }
    let synthesized = serde_json::json!({
        "usage": usage.unwrap_or(serde_json::Value::Null),
        "timings": timings.unwrap_or(serde_json::Value::Null),
    });
    UsageTokens::from_json(&synthesized).unwrap_or_default()
}

/// Parse the JSON object that follows `key` in `text`, by brace matching.
fn find_object_after(text: &str, key: &str) -> Option<serde_json::Value> {
    let at = text.rfind(key)?;
    let rest = &text[at + key.len()..];
    let open = rest.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in rest[open..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let object = &rest[open..open + i + 1];
                    return serde_json::from_str(object).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Axum fallback handler: everything that is not an explicit management
/// route lands here and is treated as an OpenAI-shaped backend request.
pub async fn proxy_handler(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response<Body> {
    match route_request(&state, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn route_request(
    state: &AppState,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    let body_bytes = body
        .collect()
        .await
        .map_err(|e| GatewayError::BackendError(format!("failed to read request body: {e}")))?
        .to_bytes();

    let Some(alias) = extract_model(&body_bytes) else {
        return Err(GatewayError::InvalidRequest(
            "request body has no 'model' field".to_string(),
        ));
    };
    trace!(path = %path, model = %alias, "proxy request");

    let controller = &state.controller;
    let catalogue = controller.catalogue();
    let config = Arc::clone(
        catalogue
            .lookup(&alias)
            .ok_or_else(|| GatewayError::ModelNotFound(alias.clone()))?,
    );
    let canonical = config.name().to_string();

    let adapter = controller
        .interfaces()
        .get(&config.mode)
        .ok_or_else(|| GatewayError::ModeMismatch(format!("unknown mode {}", config.mode)))?;
    adapter
        .validate(&path, &canonical)
        .map_err(GatewayError::ModeMismatch)?;

    // Lazy start: block until Routing or surface the failure.
    controller.ensure_running(&canonical, true).await?;

    let guard = controller
        .acquire_in_flight(&canonical)
        .ok_or_else(|| GatewayError::ModelNotFound(canonical.clone()))?;

    counter!("llmfleet_requests_total", "model" => canonical.clone()).increment(1);

    let response = forward(state, parts, body_bytes, config.port).await?;
    histogram!("llmfleet_request_ttfb_seconds", "model" => canonical.clone())
        .record(started.elapsed().as_secs_f64());

    let (resp_parts, resp_body) = response.into_parts();
    let is_sse = resp_parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    let wrapped = RecordingBody {
        inner: resp_body,
        tail: Vec::new(),
        is_sse,
        model: canonical,
        store: Arc::clone(controller.store()),
        guard: Some(guard),
        finalized: false,
    };

    Ok(Response::from_parts(resp_parts, Body::new(wrapped)))
}

async fn forward(
    state: &AppState,
    mut parts: axum::http::request::Parts,
    body_bytes: Bytes,
    port: u16,
) -> Result<Response<Body>, GatewayError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = format!("http://127.0.0.1:{port}{path_and_query}")
        .parse()
        .map_err(|e| GatewayError::Internal(format!("invalid upstream URI: {e}")))?;

    parts.uri = uri;
    parts.headers.remove("host");
    parts.headers.remove("content-length");

    let mut req = Request::from_parts(parts, Body::from(body_bytes.clone()));
    req.headers_mut()
        .insert("content-length", body_bytes.len().into());

    let response = state.client.request(req).await.map_err(|e| {
        error!(port, error = %e, "forwarding failed");
        GatewayError::BackendError(e.to_string())
    })?;

    let (parts, body) = response.into_parts();
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Response body wrapper: holds the in-flight guard until the stream ends
/// and captures a bounded tail for usage extraction. The request record is
/// written exactly once, on end-of-stream or on drop (client disconnect).
struct RecordingBody {
    inner: Body,
    tail: Vec<u8>,
    is_sse: bool,
    model: String,
    store: Arc<AccountingStore>,
    guard: Option<InFlightGuard>,
    finalized: bool,
}

impl RecordingBody {
    fn capture(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
        if self.tail.len() > USAGE_TAIL_LIMIT {
            let excess = self.tail.len() - USAGE_TAIL_LIMIT;
            self.tail.drain(..excess);
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let usage = extract_usage(&self.tail, self.is_sse);
        debug!(
            model = %self.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "request complete"
        );

        let record = RequestRecord {
            ts: unix_ts(),
            in_tok: usage.prompt_tokens,
            out_tok: usage.completion_tokens,
            cache_n: usage.cache_n,
            prompt_n: usage.prompt_n,
        };
        let store = Arc::clone(&self.store);
        let model = self.model.clone();
        tokio::spawn(async move {
            if let Err(e) = store.add_request(&model, record).await {
                // Extraction and accounting failures never fail the client.
                warn!(model = %model, error = %e, "failed to persist request record");
            }
        });

        // Releasing the guard decrements in-flight and refreshes the idle
        // clock at request end.
        self.guard.take();
    }
}

impl http_body::Body for RecordingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finalize();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordingBody {
    fn drop(&mut self) {
        // Client disconnect: record what we saw and release the guard.
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_from_body() {
        let body = Bytes::from(r#"{"model": "qwen3", "messages": []}"#);
        assert_eq!(extract_model(&body), Some("qwen3".to_string()));

        let body = Bytes::from(r#"{"messages": []}"#);
        assert_eq!(extract_model(&body), None);

        let body = Bytes::from("not json");
        assert_eq!(extract_model(&body), None);
    }

    #[test]
    fn usage_from_plain_json() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":120,"completion_tokens":30}}"#;
        let usage = extract_usage(body, false);
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.cache_n, 0);
    }

    #[test]
    fn usage_with_timings() {
        let body =
            br#"{"usage":{"prompt_tokens":100,"completion_tokens":20},"timings":{"cache_n":40,"prompt_n":60}}"#;
        let usage = extract_usage(body, false);
        assert_eq!(
            usage,
            UsageTokens {
                prompt_tokens: 100,
                completion_tokens: 20,
                cache_n: 40,
                prompt_n: 60,
            }
        );
    }

    #[test]
    fn usage_from_sse_final_frame() {
        let body = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n\
data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n\
data: [DONE]\n\n";
        let usage = extract_usage(body, true);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn sse_without_usage_is_zero() {
        let body = b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        assert_eq!(extract_usage(body, true), UsageTokens::default());
    }

    #[test]
    fn garbage_is_zero_not_error() {
        assert_eq!(extract_usage(b"\xff\xfenot json", false), UsageTokens::default());
        assert_eq!(extract_usage(b"", true), UsageTokens::default());
        let body = br#"{"usage":{"prompt_tokens":"many"}}"#;
        assert_eq!(extract_usage(body, false).prompt_tokens, 0);
    }

    #[test]
    fn truncated_json_recovers_usage_object() {
        // Front of the body lost to the tail limit; usage still parses.
        let body = br#"...",0.23]],"usage":{"prompt_tokens":55,"completion_tokens":0,"total_tokens":55}}"#;
        let usage = extract_usage(body, false);
        assert_eq!(usage.prompt_tokens, 55);
    }

    #[test]
    fn find_object_after_handles_nesting_and_strings() {
        let text = r#"junk "usage": {"a": {"b": "}"}, "prompt_tokens": 9} trailer"#;
        let value = find_object_after(text, "\"usage\"").unwrap();
        assert_eq!(value["prompt_tokens"], 9);
        assert!(find_object_after("no key here", "\"usage\"").is_none());
    }
}
