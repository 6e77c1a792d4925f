//! Error kinds surfaced by the gateway core.
//!
//! Every error that can reach a client maps onto one JSON envelope
//! (`{success: false, message, error}`) and a status code. Forwarding
//! failures are request-scoped and never change model state; lifecycle
//! failures carry the reason recorded on the model.

use axum::Json;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors surfaced by the lifecycle controller, proxy, and billing layers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("mode mismatch: {0}")]
    ModeMismatch(String),

    #[error("no launch variant is usable: required devices offline for {0}")]
    NoUsableDevice(String),

    #[error("insufficient device memory to start {0}")]
    InsufficientMemory(String),

    #[error("health probe for {model} did not pass within {timeout_secs}s")]
    StartTimeout { model: String, timeout_secs: u64 },

    #[error("backend unavailable for {model}: {reason}")]
    BackendUnavailable { model: String, reason: String },

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("tier conflict: {0}")]
    TierConflict(String),

    #[error("cannot delete the last pricing tier for {0}")]
    LastTierDeletion(String),

    #[error("invalid pricing configuration: {0}")]
    PricingInvalid(String),

    #[error("model {0} is still in the catalogue and cannot be dropped")]
    OrphanProtected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_)
            | GatewayError::ModeMismatch(_)
            | GatewayError::TierConflict(_)
            | GatewayError::LastTierDeletion(_)
            | GatewayError::PricingInvalid(_)
            | GatewayError::OrphanProtected(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoUsableDevice(_)
            | GatewayError::InsufficientMemory(_)
            | GatewayError::StartTimeout { .. }
            | GatewayError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind tag used in the JSON envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::ModeMismatch(_) => "mode_mismatch",
            GatewayError::NoUsableDevice(_) => "no_usable_device",
            GatewayError::InsufficientMemory(_) => "insufficient_memory",
            GatewayError::StartTimeout { .. } => "start_timeout",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::BackendError(_) => "backend_error",
            GatewayError::TierConflict(_) => "tier_conflict",
            GatewayError::LastTierDeletion(_) => "last_tier_deletion",
            GatewayError::PricingInvalid(_) => "pricing_invalid",
            GatewayError::OrphanProtected(_) => "orphan_protected",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Internal(format!("database error: {e}"))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
            "error": self.kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}
